use std::collections::BTreeMap;

use bon::Builder;
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use strum_macros::{Display, EnumIter, EnumString};
use time::OffsetDateTime;

/// Device classes the broker can expose.
#[derive(
    Debug,
    Clone,
    Copy,
    Eq,
    PartialEq,
    Hash,
    Display,
    EnumIter,
    EnumString,
    SerializeDisplay,
    DeserializeFromStr,
)]
pub enum DeviceKind {
    #[strum(to_string = "printer")]
    Printer,
    #[strum(to_string = "serial")]
    Serial,
    #[strum(to_string = "usb_hid")]
    UsbHid,
    #[strum(to_string = "network")]
    Network,
    #[strum(to_string = "biometric")]
    Biometric,
}

/// Coarse device availability.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Display, EnumString, SerializeDisplay, DeserializeFromStr,
)]
pub enum DeviceStatus {
    #[strum(to_string = "available")]
    Available,
    #[strum(to_string = "connected")]
    Connected,
    #[strum(to_string = "error")]
    Error,
    #[strum(to_string = "offline")]
    Offline,
}

/// Free-form scalar stored in a device's property map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Flag(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<u16> for PropertyValue {
    fn from(value: u16) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Flag(value)
    }
}

/// A physical or virtual endpoint known to the broker.
///
/// The `id` is derived deterministically from the kind plus a discriminator
/// (port name, vendor/product pair, host and port) so rediscoveries of the
/// same hardware land on the same record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[builder(on(String, into))]
pub struct Device {
    pub id: String,
    pub kind: DeviceKind,
    pub name: String,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
    #[builder(default = DeviceStatus::Available)]
    pub status: DeviceStatus,
    #[builder(default)]
    pub is_connected: bool,
    #[serde(with = "time::serde::rfc3339")]
    #[builder(default = OffsetDateTime::now_utc())]
    pub last_seen: OffsetDateTime,
    #[builder(default)]
    pub properties: BTreeMap<String, PropertyValue>,
}

impl Device {
    /// Returns one textual property, when present.
    #[must_use]
    pub fn text_property(&self, key: &str) -> Option<&str> {
        match self.properties.get(key) {
            Some(PropertyValue::Text(value)) => Some(value),
            _ => None,
        }
    }

    /// Returns one integral property, when present.
    #[must_use]
    pub fn integer_property(&self, key: &str) -> Option<i64> {
        match self.properties.get(key) {
            Some(PropertyValue::Integer(value)) => Some(*value),
            _ => None,
        }
    }

    /// Returns the TCP endpoint discovery resolved for this device, when
    /// one is known. A resolved address wins over the advertised hostname.
    #[must_use]
    pub fn network_endpoint(&self) -> Option<(String, u16)> {
        let host = self
            .text_property("resolved_host")
            .or_else(|| self.text_property("host"))?;
        let port = u16::try_from(self.integer_property("port")?).ok()?;
        Some((host.to_owned(), port))
    }
}

/// Derives the stable id for a TCP-reachable device.
#[must_use]
pub fn network_device_id(host: &str, port: u16) -> String {
    format!("net_{}_{port}", sanitise(host))
}

/// Derives the stable id for a serial port.
#[must_use]
pub fn serial_device_id(port_name: &str) -> String {
    format!("serial_{}", sanitise(port_name))
}

/// Derives the stable id for an OS-managed printer queue.
#[must_use]
pub fn printer_device_id(queue_name: &str) -> String {
    format!("printer_{}", sanitise(queue_name))
}

/// Derives the stable id for a USB HID device.
#[must_use]
pub fn usb_device_id(vendor_id: u16, product_id: u16) -> String {
    format!("usb_{vendor_id:04x}_{product_id:04x}")
}

fn sanitise(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("192.168.1.50", 9100, "net_192_168_1_50_9100")]
    #[case("label-printer.local", 9100, "net_label_printer_local_9100")]
    fn network_ids_are_stable(#[case] host: &str, #[case] port: u16, #[case] expected: &str) {
        assert_eq!(expected, network_device_id(host, port));
        assert_eq!(expected, network_device_id(host, port));
    }

    #[rstest]
    #[case("/dev/ttyUSB0", "serial__dev_ttyusb0")]
    #[case("COM3", "serial_com3")]
    fn serial_ids_normalise_port_names(#[case] port: &str, #[case] expected: &str) {
        assert_eq!(expected, serial_device_id(port));
    }

    #[test]
    fn usb_ids_use_hex_vendor_product() {
        assert_eq!("usb_04b8_0e15", usb_device_id(0x04b8, 0x0e15));
    }

    #[test]
    fn kind_round_trips_through_display() {
        let parsed: DeviceKind = "usb_hid".parse().expect("kind should parse");
        assert_eq!(DeviceKind::UsbHid, parsed);
        assert_eq!("usb_hid", DeviceKind::UsbHid.to_string());
    }

    #[test]
    fn network_endpoint_prefers_the_resolved_host() {
        let mut device = Device::builder()
            .id(printer_device_id("Label_Printer"))
            .kind(DeviceKind::Printer)
            .name("Label_Printer")
            .build();
        assert_eq!(None, device.network_endpoint());

        device
            .properties
            .insert("host".to_owned(), "printer.local".into());
        assert_eq!(None, device.network_endpoint(), "a host without a port is not an endpoint");

        device
            .properties
            .insert("port".to_owned(), PropertyValue::Integer(9100));
        assert_eq!(
            Some(("printer.local".to_owned(), 9100)),
            device.network_endpoint()
        );

        device
            .properties
            .insert("resolved_host".to_owned(), "192.168.1.50".into());
        assert_eq!(
            Some(("192.168.1.50".to_owned(), 9100)),
            device.network_endpoint()
        );
    }

    #[test]
    fn device_serialises_with_snake_case_kind() {
        let device = Device::builder()
            .id(network_device_id("10.0.0.9", 9100))
            .kind(DeviceKind::Network)
            .name("10.0.0.9:9100")
            .build();
        let value = serde_json::to_value(&device).expect("device should serialise");
        assert_eq!("network", value["kind"]);
        assert_eq!("available", value["status"]);
        assert_eq!(false, value["is_connected"]);
    }
}
