use std::fmt;
use std::hash::Hash;

//------------ AddressFamily (trait) ----------------------------------------

/// The address family of an IP prefix as a trait.
///
/// Each family gets a separate, exactly fitting integer type, so that an
/// IPv4 tree does not pay for IPv6-sized keys. Prefix bits are stored
/// left-aligned: bit 0 is the most significant bit of the address.
pub trait AddressFamily:
    num_traits::PrimInt
    + fmt::Binary
    + fmt::Debug
    + Hash
    + Send
    + Sync
    + 'static
{
    /// The number of bits in the byte representation of the family.
    const BITS: u8;

    /// Returns the bit at `index`, counting from the most significant bit.
    fn bit(self, index: u8) -> bool {
        (self >> (Self::BITS - 1 - index) as usize) & Self::one()
            == Self::one()
    }

    /// Clears all bits beyond the first `len` bits.
    fn truncate_to_len(self, len: u8) -> Self {
        match len {
            0 => Self::zero(),
            len if len < Self::BITS => {
                (self >> (Self::BITS - len) as usize)
                    << (Self::BITS - len) as usize
            }
            len if len == Self::BITS => self,
            len => {
                panic!("Can't truncate to more than {} bits: {}",
                    Self::BITS, len)
            }
        }
    }

    /// Returns whether the first `len` bits of `self` and `other` agree.
    fn matches_to_len(self, other: Self, len: u8) -> bool {
        self.truncate_to_len(len) == other.truncate_to_len(len)
    }
}

/// Exactly fitting IPv4 prefix bits (4 octets).
impl AddressFamily for u32 {
    const BITS: u8 = 32;
}

/// Exactly fitting IPv6 prefix bits (16 octets).
impl AddressFamily for u128 {
    const BITS: u8 = 128;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msb_indexed_bits() {
        let net = 0b1010_0000_u32 << 24;
        assert!(net.bit(0));
        assert!(!net.bit(1));
        assert!(net.bit(2));
        assert!(!net.bit(31));
    }

    #[test]
    fn truncation() {
        let net = 0x0a01_0203_u32;
        assert_eq!(net.truncate_to_len(0), 0);
        assert_eq!(net.truncate_to_len(8), 0x0a00_0000);
        assert_eq!(net.truncate_to_len(16), 0x0a01_0000);
        assert_eq!(net.truncate_to_len(32), net);
        assert!(0x0a01_0203_u32.matches_to_len(0x0a01_ffff, 16));
        assert!(!0x0a01_0203_u32.matches_to_len(0x0a02_0000, 16));
    }
}
