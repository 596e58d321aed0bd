//! Hash field helpers for Sysmon `Hashes` values.

/// Pull the SHA256 value out of `"SHA256=..,MD5=..,SHA1=.."`.
///
/// A single unlabeled value is taken to be SHA256; labeled input without a
/// SHA256 entry yields an empty string.
pub fn extract_sha256(hashes: &str) -> String {
    let hashes = hashes.trim();
    if hashes.is_empty() {
        return String::new();
    }
    if !hashes.contains('=') {
        return hashes.to_string();
    }
    hashes
        .split(',')
        .filter_map(|part| part.split_once('='))
        .find(|(algo, _)| algo.trim().eq_ignore_ascii_case("SHA256"))
        .map(|(_, value)| value.trim().to_string())
        .unwrap_or_default()
}
