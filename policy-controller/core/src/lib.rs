#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod document;
pub mod network;
pub mod rules;
pub mod template;

pub use self::{
    document::{MalformedField, RuleContent},
    rules::{ByDirection, Direction, ValueKind},
};
pub use ipnet::{IpNet, Ipv4Net, Ipv6Net};
pub use serde_json::{Map, Value};
