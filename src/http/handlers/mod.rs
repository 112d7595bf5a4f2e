//! One module per resource group, each mapping its domain component onto
//! the HTTP surface.

pub mod apn;
pub mod auth;
pub mod info;
pub mod ipv6;
pub mod network;
pub mod rathole;
pub mod sms;
pub mod usb;
