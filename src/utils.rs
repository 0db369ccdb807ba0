//! Identifier helpers

use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique id from a fresh uuid7 then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Human-readable lot code, unique per unit: `CWB001-L0042`.
pub fn lot_code(unit_code: &str, number: u64) -> String {
    format!("{}-L{:04}", unit_code, number)
}

/// Initials of a display name, used wherever a volunteer is shown publicly.
pub fn initials(name: &str) -> String {
    name.split_whitespace()
        .filter_map(|part| part.chars().next())
        .flat_map(|c| c.to_uppercase())
        .map(|c| format!("{c}."))
        .collect()
}
