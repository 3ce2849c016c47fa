//! Static knowledge about known PatchRAM controllers.

/// Devices that emit an unsolicited VENDOR event after END_OF_RECORD and
/// expect the host to wait for it before the final reset.
const HANDSHAKE_DEVICES: &[(u16, u16)] = &[
    (0x0a5c, 0x216f),
    (0x0a5c, 0x21ec),
    (0x0a5c, 0x6412),
    (0x0a5c, 0x6414),
    (0x0489, 0xe07a),
];

const SUBVER_TABLE: &[(u16, &str)] = &[
    (0x2105, "BCM20703A1"), // 001.001.005
    (0x210b, "BCM43142A0"), // 001.001.011
    (0x2112, "BCM4314A0"),  // 001.001.018
    (0x2118, "BCM20702A0"), // 001.001.024
    (0x2126, "BCM4335A0"),  // 001.001.038
    (0x220e, "BCM20702A1"), // 001.002.014
    (0x230f, "BCM4356A2"),  // 001.003.015
    (0x4106, "BCM4335B0"),  // 002.001.006
    (0x410e, "BCM20702B0"), // 002.001.014
    (0x6109, "BCM4335C0"),  // 003.001.009
    (0x610c, "BCM4354"),    // 003.001.012
    (0x6607, "BCM4350C5"),  // 003.006.007
];

pub fn supports_handshake(vendor_id: u16, product_id: u16) -> bool {
    HANDSHAKE_DEVICES
        .iter()
        .any(|&(vid, pid)| vid == vendor_id && pid == product_id)
}

/// Canonical controller name for an `lmp_subver`, or "BCM" when unknown.
pub fn controller_name(lmp_subver: u16) -> &'static str {
    SUBVER_TABLE
        .iter()
        .find(|&&(subver, _)| subver == lmp_subver)
        .map(|&(_, name)| name)
        .unwrap_or("BCM")
}

/// Firmware identity for logs, e.g. `BCM20702A0_001.001.024.0560`.
pub fn firmware_display(lmp_subver: u16, hci_rev: u16) -> String {
    format!(
        "{}_{:03}.{:03}.{:03}.{:04}",
        controller_name(lmp_subver),
        (lmp_subver >> 13) & 0x7,
        (lmp_subver >> 8) & 0x1f,
        lmp_subver & 0xff,
        hci_rev & 0x0fff,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_membership() {
        assert!(supports_handshake(0x0a5c, 0x216f));
        assert!(supports_handshake(0x0489, 0xe07a));
        assert!(!supports_handshake(0x0a5c, 0xffff));
        assert!(!supports_handshake(0x0b05, 0x17cb));
    }

    #[test]
    fn known_controller_display() {
        assert_eq!(controller_name(0x2118), "BCM20702A0");
        assert_eq!(firmware_display(0x2118, 0x1230), "BCM20702A0_001.001.024.0560");
    }

    #[test]
    fn unknown_controller_falls_back_to_bcm() {
        assert_eq!(controller_name(0x0000), "BCM");
        assert_eq!(firmware_display(0x1234, 0x2000), "BCM_000.018.052.0000");
    }
}
