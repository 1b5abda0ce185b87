//! Fixed-width flow fingerprint shared by all three stages.

pub use crate::consts::KEY_LEN;

/// An opaque, fixed-width flow fingerprint. The core never interns or
/// otherwise interprets a flow's identity beyond this byte string — it
/// arrives from the host already fingerprinted (e.g. a hash of the 5-tuple).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId(pub [u8; KEY_LEN]);

impl FlowId {
    /// Build a fingerprint from an arbitrary byte slice, NUL-padded (or
    /// truncated) to `KEY_LEN` bytes, per spec §6: "the core treats only the
    /// first `KEY_LEN` bytes, NUL-padded".
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0u8; KEY_LEN];
        let n = bytes.len().min(KEY_LEN);
        buf[..n].copy_from_slice(&bytes[..n]);
        FlowId(buf)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Spec §3's emptiness test: `ID[0]==0`, a single leading byte rather
    /// than the whole fingerprint. `Stage3Cell` uses this directly.
    pub fn is_zero(&self) -> bool {
        self.0[0] == 0
    }
}

impl std::fmt::Debug for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FlowId(")?;
        for b in self.0.iter().take_while(|b| **b != 0) {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

impl Default for FlowId {
    fn default() -> Self {
        FlowId([0u8; KEY_LEN])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_short_input_with_nuls() {
        let id = FlowId::from_bytes(b"abc");
        assert_eq!(&id.0[..3], b"abc");
        assert!(id.0[3..].iter().all(|b| *b == 0));
    }

    #[test]
    fn truncates_long_input() {
        let long = [7u8; KEY_LEN + 8];
        let id = FlowId::from_bytes(&long);
        assert_eq!(id.0, [7u8; KEY_LEN]);
    }

    #[test]
    fn zero_flow_is_empty() {
        assert!(FlowId::default().is_zero());
        assert!(!FlowId::from_bytes(b"x").is_zero());
    }
}
