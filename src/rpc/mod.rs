mod biometric;
mod devices;
mod network;
mod printer;
mod queue;
mod serial;
mod settings;
mod system;
mod usb;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::DeserializeOwned;
use serde_json::Value;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use strum_macros::{Display, EnumString};
use tracing::debug;

use crate::broker::Broker;
use crate::protocol::{self, RpcError};
use crate::transport::SessionHandle;

/// Result every handler produces.
pub type HandlerResult = Result<Value, RpcError>;

type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;
type Handler = Box<dyn Fn(Arc<Broker>, Arc<SessionHandle>, Value) -> HandlerFuture + Send + Sync>;

/// Encoding of binary payloads inside text fields. The wire never carries
/// binary frames; each method states which encoding its fields use.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Eq,
    PartialEq,
    Display,
    EnumString,
    SerializeDisplay,
    DeserializeFromStr,
)]
pub enum PayloadEncoding {
    #[default]
    #[strum(to_string = "utf8")]
    Utf8,
    #[strum(to_string = "base64")]
    Base64,
    #[strum(to_string = "hex")]
    Hex,
}

/// Decodes a text payload field.
///
/// # Errors
///
/// Returns an invalid-params error when the text does not match the
/// declared encoding.
pub fn decode_payload(data: &str, encoding: PayloadEncoding) -> Result<Vec<u8>, RpcError> {
    match encoding {
        PayloadEncoding::Utf8 => Ok(data.as_bytes().to_vec()),
        PayloadEncoding::Base64 => BASE64
            .decode(data)
            .map_err(|error| RpcError::invalid_params(format!("invalid base64 data: {error}"))),
        PayloadEncoding::Hex => hex::decode(data)
            .map_err(|error| RpcError::invalid_params(format!("invalid hex data: {error}"))),
    }
}

/// Encodes bytes for a text payload field.
#[must_use]
pub fn encode_payload(bytes: &[u8], encoding: PayloadEncoding) -> String {
    match encoding {
        PayloadEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        PayloadEncoding::Base64 => BASE64.encode(bytes),
        PayloadEncoding::Hex => hex::encode(bytes),
    }
}

pub(crate) fn encode_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub(crate) fn decode_base64(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(data)
}

/// Deserialises handler params, treating absent params as an empty object.
pub(crate) fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    let params = if params.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        params
    };
    serde_json::from_value(params).map_err(|error| RpcError::invalid_params(error.to_string()))
}

/// Name → handler table, grouped by namespace.
pub struct Dispatcher {
    handlers: HashMap<&'static str, Handler>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Builds the table with every namespace registered.
    #[must_use]
    pub fn new() -> Self {
        let mut dispatcher = Self {
            handlers: HashMap::new(),
        };
        devices::register(&mut dispatcher);
        printer::register(&mut dispatcher);
        serial::register(&mut dispatcher);
        usb::register(&mut dispatcher);
        network::register(&mut dispatcher);
        biometric::register(&mut dispatcher);
        queue::register(&mut dispatcher);
        system::register(&mut dispatcher);
        settings::register(&mut dispatcher);
        dispatcher
    }

    pub(crate) fn register<F, Fut>(&mut self, method: &'static str, handler: F)
    where
        F: Fn(Arc<Broker>, Arc<SessionHandle>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.insert(
            method,
            Box::new(move |broker, session, params| -> HandlerFuture {
                Box::pin(handler(broker, session, params))
            }),
        );
    }

    /// Sorted method catalogue.
    #[must_use]
    pub fn methods(&self) -> Vec<&'static str> {
        let mut methods: Vec<&'static str> = self.handlers.keys().copied().collect();
        methods.sort_unstable();
        methods
    }

    /// Parses and dispatches one inbound text frame. Returns the response
    /// frame, or `None` for notifications (requests without an `id`).
    pub async fn dispatch(
        &self,
        broker: Arc<Broker>,
        session: Arc<SessionHandle>,
        text: &str,
    ) -> Option<String> {
        let request = match protocol::parse_frame(text) {
            Ok(request) => request,
            Err(error) => {
                // Parse errors answer with a null id; structurally invalid
                // requests echo the id when one survives.
                let id = match &error {
                    RpcError::Parse { .. } => None,
                    _ => extract_id(text),
                };
                return Some(protocol::error_frame(id.as_ref(), &error));
            }
        };

        let method = request.method.as_deref().unwrap_or_default().to_owned();
        let id = request.id;

        let Some(handler) = self.handlers.get(method.as_str()) else {
            let error = RpcError::MethodNotFound { method };
            return id.map(|id| protocol::error_frame(Some(&id), &error));
        };

        debug!(%method, session_id = %session.id(), "dispatching request");
        let result = handler(broker, session, request.params).await;

        let id = id?;
        Some(match result {
            Ok(result) => protocol::result_frame(&id, result),
            Err(error) => protocol::error_frame(Some(&id), &error),
        })
    }
}

fn extract_id(text: &str) -> Option<Value> {
    let value: Value = serde_json::from_str(text).ok()?;
    let id = value.get("id")?;
    match id {
        Value::Number(_) | Value::String(_) => Some(id.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("TEST\n", PayloadEncoding::Utf8, b"TEST\n".to_vec())]
    #[case("VEVTVAo=", PayloadEncoding::Base64, b"TEST\n".to_vec())]
    #[case("544553540a", PayloadEncoding::Hex, b"TEST\n".to_vec())]
    fn payloads_decode_per_encoding(
        #[case] data: &str,
        #[case] encoding: PayloadEncoding,
        #[case] expected: Vec<u8>,
    ) {
        let decoded = decode_payload(data, encoding).expect("payload should decode");
        assert_eq!(expected, decoded);
    }

    #[rstest]
    #[case("zz!", PayloadEncoding::Base64)]
    #[case("abc", PayloadEncoding::Hex)]
    fn malformed_payloads_are_invalid_params(#[case] data: &str, #[case] encoding: PayloadEncoding) {
        let result = decode_payload(data, encoding);
        assert_matches!(result, Err(RpcError::InvalidParams { .. }));
    }

    #[test]
    fn encode_round_trips() {
        let bytes = b"\x1b@label";
        for encoding in [PayloadEncoding::Base64, PayloadEncoding::Hex] {
            let encoded = encode_payload(bytes, encoding);
            assert_eq!(bytes.to_vec(), decode_payload(&encoded, encoding).expect("round trip"));
        }
    }

    #[test]
    fn method_catalogue_is_sorted_and_complete() {
        let dispatcher = Dispatcher::new();
        let methods = dispatcher.methods();
        for method in [
            "devices.enumerate",
            "devices.get",
            "devices.watch",
            "devices.unwatch",
            "printer.print",
            "printer.getStatus",
            "printer.getCapabilities",
            "serial.open",
            "serial.close",
            "serial.send",
            "serial.receive",
            "serial.getStatus",
            "usb.open",
            "usb.close",
            "usb.sendReport",
            "usb.receiveReport",
            "usb.getStatus",
            "network.connect",
            "network.disconnect",
            "network.ping",
            "network.discover",
            "network.send",
            "network.getStatus",
            "biometric.enroll",
            "biometric.authenticate",
            "biometric.identify",
            "biometric.getStatus",
            "biometric.getUsers",
            "biometric.deleteUser",
            "queue.getStatus",
            "queue.getJobs",
            "queue.cancelJob",
            "queue.retryJob",
            "system.getInfo",
            "system.getHealth",
            "settings.get",
            "settings.save",
        ] {
            assert!(methods.contains(&method), "missing method `{method}`");
        }
        let mut sorted = methods.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, methods);
    }
}
