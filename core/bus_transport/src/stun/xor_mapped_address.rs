//! XOR-MAPPED-ADDRESS attribute body (RFC 5389 Section 15.2)

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::Range;

use super::cursor::{OutputBuffer, Reader};
use super::{StunError, XorKey};

// ============================================================================
// Constants
// ============================================================================

/// Wire value of the IPv4 family octet
const FAMILY_IPV4: u8 = 0x01;

/// Wire value of the IPv6 family octet
const FAMILY_IPV6: u8 = 0x02;

const IPV4_LEN: usize = 4;
const IPV6_LEN: usize = 16;

/// Smallest possible body: reserved + family + port + IPv4 address
pub const MIN_ATTR_SIZE: usize = 1 + 1 + 2 + IPV4_LEN;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    fn from_wire(octet: u8) -> Result<Self, StunError> {
        match octet {
            FAMILY_IPV4 => Ok(AddressFamily::V4),
            FAMILY_IPV6 => Ok(AddressFamily::V6),
            other => Err(StunError::InvalidAddressFamily(other)),
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            AddressFamily::V4 => FAMILY_IPV4,
            AddressFamily::V6 => FAMILY_IPV6,
        }
    }

    /// Address length in octets
    pub fn address_len(self) -> usize {
        match self {
            AddressFamily::V4 => IPV4_LEN,
            AddressFamily::V6 => IPV6_LEN,
        }
    }

    /// Family implied by a raw address length (4 or 16 octets)
    pub fn from_address_len(len: usize) -> Result<Self, StunError> {
        match len {
            IPV4_LEN => Ok(AddressFamily::V4),
            IPV6_LEN => Ok(AddressFamily::V6),
            other => Err(StunError::InvalidAddressFamily(
                u8::try_from(other).unwrap_or(u8::MAX),
            )),
        }
    }
}

/// Logical (un-obfuscated) value of an XOR-MAPPED-ADDRESS attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XorMappedAddress {
    pub address: IpAddr,
    pub port: u16,
}

impl XorMappedAddress {
    pub fn new(address: IpAddr, port: u16) -> Self {
        XorMappedAddress { address, port }
    }

    pub fn family(&self) -> AddressFamily {
        match self.address {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Parse the attribute body starting at the beginning of `buf`.
    ///
    /// Returns the decoded value and the number of bytes consumed.
    pub fn parse(buf: &[u8], key: &XorKey) -> Result<(Self, usize), StunError> {
        Self::parse_at(buf, 0, key)
    }

    /// Parse the attribute body starting at `offset` within `buf`.
    ///
    /// On error nothing is constructed and the caller must fail the whole
    /// enclosing message.
    pub fn parse_at(buf: &[u8], offset: usize, key: &XorKey) -> Result<(Self, usize), StunError> {
        let mut reader = Reader::at(buf, offset);
        let start = reader.position();

        if let Err(e) = reader.require(MIN_ATTR_SIZE) {
            log::debug!("XOR-MAPPED-ADDRESS: {}", e);
            return Err(e);
        }

        reader.skip(1)?;
        let family_octet = reader.read_u8()?;
        let x_port = reader.read_u16_be()?;

        let family = AddressFamily::from_wire(family_octet).map_err(|e| {
            log::debug!("XOR-MAPPED-ADDRESS: {}", e);
            e
        })?;

        let port = x_port ^ XorKey::port_mask();

        let raw = reader.read_bytes(family.address_len())?;
        let address = match family {
            AddressFamily::V4 => {
                let mut octets = [0u8; IPV4_LEN];
                octets.copy_from_slice(raw);
                key.apply(&mut octets);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            AddressFamily::V6 => {
                let mut octets = [0u8; IPV6_LEN];
                octets.copy_from_slice(raw);
                key.apply(&mut octets);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
        };

        Ok((XorMappedAddress { address, port }, reader.position() - start))
    }

    /// Render the attribute body into `out`.
    ///
    /// The generic attribute header must already have been written by the
    /// caller. Returns the range of `out` covered by the body.
    pub fn render(&self, key: &XorKey, out: &mut OutputBuffer) -> Result<Range<usize>, StunError> {
        let mut octets = match self.address {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        let family = AddressFamily::from_address_len(octets.len())?;
        key.apply(&mut octets);

        let start = out.push_u8(0).start;
        out.push_u8(family.to_wire());
        out.push_u16_be(self.port ^ XorKey::port_mask());
        let end = out.append(&octets).end;

        Ok(start..end)
    }

    /// Encoded body length for this value
    pub fn encoded_len(&self) -> usize {
        4 + self.family().address_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stun::TransactionId;

    /// RFC 5769 Section 2.2 sample IPv4 response
    const RFC5769_TID: [u8; 12] = [
        0xb7, 0xe7, 0xa7, 0x01, 0xbc, 0x34, 0xd6, 0x86, 0xfa, 0x87, 0xdf, 0xae,
    ];

    fn rfc_key() -> XorKey {
        XorKey::new(&TransactionId::new(RFC5769_TID))
    }

    #[test]
    fn test_parse_rfc5769_ipv4() {
        // 192.0.2.1:32853
        let body = [0x00, 0x01, 0xa1, 0x47, 0xe1, 0x12, 0xa6, 0x43];
        let (value, consumed) = XorMappedAddress::parse(&body, &rfc_key()).unwrap();
        assert_eq!(consumed, 8);
        assert_eq!(value.address, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));
        assert_eq!(value.port, 32853);
        assert_eq!(value.family(), AddressFamily::V4);
    }

    #[test]
    fn test_parse_rfc5769_ipv6() {
        // 2001:db8:1234:5678:11:2233:4455:6677 port 32853
        let body = [
            0x00, 0x02, 0xa1, 0x47, 0x01, 0x13, 0xa9, 0xfa, 0xa5, 0xd3, 0xf1, 0x79, 0xbc, 0x25,
            0xf4, 0xb5, 0xbe, 0xd2, 0xb9, 0xd9,
        ];
        let (value, consumed) = XorMappedAddress::parse(&body, &rfc_key()).unwrap();
        assert_eq!(consumed, 20);
        assert_eq!(
            value.address,
            "2001:db8:1234:5678:11:2233:4455:6677"
                .parse::<IpAddr>()
                .unwrap()
        );
        assert_eq!(value.port, 32853);
    }

    #[test]
    fn test_render_matches_rfc_vector() {
        let value = XorMappedAddress::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 32853);
        let mut out = OutputBuffer::new();
        let range = value.render(&rfc_key(), &mut out).unwrap();
        assert_eq!(range, 0..8);
        assert_eq!(
            out.as_slice(),
            &[0x00, 0x01, 0xa1, 0x47, 0xe1, 0x12, 0xa6, 0x43]
        );
    }

    #[test]
    fn test_round_trip_after_other_output() {
        // Preceding bytes in the buffer must not influence the key.
        let key = XorKey::new(&TransactionId::new([7u8; 12]));
        let values = [
            XorMappedAddress::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)), 54321),
            XorMappedAddress::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            XorMappedAddress::new(IpAddr::V6(Ipv6Addr::LOCALHOST), u16::MAX),
            XorMappedAddress::new("fe80::1:2:3:4".parse().unwrap(), 4433),
        ];
        for value in values {
            let mut out = OutputBuffer::new();
            out.append(&[0xde, 0xad, 0xbe, 0xef]);
            let range = value.render(&key, &mut out).unwrap();
            assert_eq!(range.len(), value.encoded_len());

            let (decoded, consumed) =
                XorMappedAddress::parse_at(out.as_slice(), range.start, &key).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, range.len());
        }
    }

    #[test]
    fn test_parse_too_small() {
        let body = [0x00, 0x01, 0xa1, 0x47, 0xe1, 0x12, 0xa6];
        assert_eq!(
            XorMappedAddress::parse(&body, &rfc_key()),
            Err(StunError::BufferTooSmall {
                needed: MIN_ATTR_SIZE,
                available: 7
            })
        );
    }

    #[test]
    fn test_parse_truncated_ipv6() {
        let body = [0x00, 0x02, 0xa1, 0x47, 0x01, 0x13, 0xa9, 0xfa, 0xa5, 0xd3];
        assert!(matches!(
            XorMappedAddress::parse(&body, &rfc_key()),
            Err(StunError::BufferTooSmall { needed: 16, .. })
        ));
    }

    #[test]
    fn test_parse_invalid_family() {
        for family in [0x00u8, 0x03, 0x04, 0xff] {
            let body = [0x00, family, 0xa1, 0x47, 0xe1, 0x12, 0xa6, 0x43];
            assert_eq!(
                XorMappedAddress::parse(&body, &rfc_key()),
                Err(StunError::InvalidAddressFamily(family))
            );
        }
    }

    #[test]
    fn test_family_from_bad_length() {
        assert_eq!(
            AddressFamily::from_address_len(6),
            Err(StunError::InvalidAddressFamily(6))
        );
    }

    #[test]
    fn test_render_parse_sweep() {
        use ring::rand::{SecureRandom, SystemRandom};

        const ROUNDS: usize = 4096;
        let rng = SystemRandom::new();

        for round in 0..ROUNDS {
            let tid = TransactionId::random().unwrap();
            let key = XorKey::new(&tid);

            let mut raw = [0u8; 2 + IPV6_LEN];
            rng.fill(&mut raw).unwrap();
            let port = match round {
                0 => 0,
                1 => u16::MAX,
                2 => XorKey::port_mask(),
                _ => u16::from_be_bytes([raw[0], raw[1]]),
            };
            let address = if round % 2 == 0 {
                let mut octets = [0u8; IPV4_LEN];
                octets.copy_from_slice(&raw[2..2 + IPV4_LEN]);
                IpAddr::V4(Ipv4Addr::from(octets))
            } else {
                let mut octets = [0u8; IPV6_LEN];
                octets.copy_from_slice(&raw[2..]);
                IpAddr::V6(Ipv6Addr::from(octets))
            };
            let value = XorMappedAddress::new(address, port);

            // Unrelated bytes ahead of the body, as in a full message.
            let mut out = OutputBuffer::new();
            out.append(&raw[..round % 7]);
            let range = value.render(&key, &mut out).unwrap();
            assert_eq!(range.len(), value.encoded_len());

            let (decoded, consumed) =
                XorMappedAddress::parse_at(out.as_slice(), range.start, &key).unwrap();
            assert_eq!(decoded, value, "round {} tid {:02x?}", round, tid.as_bytes());
            assert_eq!(consumed, range.len());
        }
    }
}
