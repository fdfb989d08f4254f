use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use qrcode::{QrCode, render::svg};

/// Renders a pairing code as an SVG image wrapped in a `data:` URL.
///
/// Returns `None` when the code does not fit in a QR symbol.
pub fn render_svg_data_url(code: &str) -> Option<String> {
    let symbol = match QrCode::new(code.as_bytes()) {
        Ok(symbol) => symbol,
        Err(error) => {
            tracing::warn!(error = %error, "unable to render pairing code");
            return None;
        }
    };

    let image = symbol
        .render::<svg::Color>()
        .min_dimensions(256, 256)
        .quiet_zone(true)
        .build();

    Some(format!("data:image/svg+xml;base64,{}", STANDARD.encode(image)))
}
