// Jackson Coxson's `Connection`/`UsbmuxdDevice` split, generalized to carry the
// fields the binary wire format actually reports (product id, location).

use std::net::IpAddr;

/// How a device is physically attached to the mux daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    Usb,
    Network(IpAddr),
    Unknown(String),
}

/// A device as reported by a `DeviceAdd`/`Attached` mux event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub device_id: u32,
    pub product_id: u16,
    pub serial: String,
    pub location: u32,
    pub connection: Connection,
}

/// A `DeviceAdd`/`DeviceRemove` event from the mux listener socket.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Attach(DeviceHandle),
    Detach(u32),
}
