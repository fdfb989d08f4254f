use serde::Deserialize;
use serde_json::Value;

use crate::{provider::ProviderState, status::QrPayload};

/// What a provider websocket frame says about one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEventKind {
    /// A new pairing code was issued.
    QrUpdated(QrPayload),
    /// The code was scanned; the device is pairing.
    QrScanned,
    /// `connection.update` with the given state.
    Connection(ProviderState),
    /// The underlying socket dropped and is being re-established.
    StreamInterrupted,
}

/// A parsed frame tagged by instance name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusEvent {
    pub instance_name: String,
    pub kind: BusEventKind,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawQr {
    Code(String),
    Object {
        code: Option<String>,
        base64: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    event: Option<String>,
    #[serde(alias = "instance_name", alias = "instanceName")]
    instance: Option<String>,
    data: Option<Value>,
}

fn is_scan_event(event: &str) -> bool {
    let normalized = event.to_ascii_lowercase().replace(['_', '-'], ".");
    matches!(normalized.as_str(), "qrcode.scanned" | "qr.scanned")
}

/// Decodes one text frame.
///
/// Only text that is not JSON is an error. Any JSON value that carries nothing the
/// bus routes (unknown events, array or scalar `data`, no instance) is `Ok(None)`.
pub fn decode_frame(text: &str) -> Result<Option<BusEvent>, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    Ok(decode_value(&value))
}

fn decode_value(value: &Value) -> Option<BusEvent> {
    let frame = RawFrame::deserialize(value).ok()?;
    let instance_name = frame.instance.filter(|name| !name.is_empty())?;

    let data = frame.data.as_ref().and_then(Value::as_object);
    let state = data
        .and_then(|data| data.get("state"))
        .and_then(Value::as_str);
    let qrcode = data
        .and_then(|data| data.get("qrcode"))
        .and_then(|qr| RawQr::deserialize(qr).ok());

    let kind = if let Some(state) = state {
        BusEventKind::Connection(ProviderState::parse(state))
    } else if let Some(qr) = qrcode {
        let (code, image) = match qr {
            RawQr::Code(code) => (Some(code), None),
            RawQr::Object { code, base64 } => (code, base64),
        };
        match code.filter(|code| !code.is_empty()) {
            Some(code) => BusEventKind::QrUpdated(QrPayload::new(code, image)),
            None => return None,
        }
    } else if frame.event.as_deref().is_some_and(is_scan_event) {
        BusEventKind::QrScanned
    } else {
        return None;
    };

    Some(BusEvent {
        instance_name,
        kind,
    })
}
