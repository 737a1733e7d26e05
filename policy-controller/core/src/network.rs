use crate::document::MalformedField;
use ipnet::IpNet;

/// Parses a CIDR string into its canonical network form, clearing any host
/// bits (`10.72.16.5/20` becomes `10.72.16.0/20`).
pub fn parse_cidr(s: &str) -> Result<IpNet, MalformedField> {
    s.parse::<IpNet>()
        .map(|net| net.trunc())
        .map_err(|source| MalformedField::Cidr {
            value: s.to_string(),
            source,
        })
}

/// Two networks intersect when either contains the other's base address.
pub fn intersects(a: &IpNet, b: &IpNet) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}
