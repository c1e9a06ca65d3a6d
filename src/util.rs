use std::ascii;

/// Renders raw protocol bytes for logs, escaping anything non-printable.
pub fn bytes_to_human_str(input: &[u8]) -> String {
    input
        .iter()
        .flat_map(|&c| ascii::escape_default(c))
        .map(char::from)
        .collect()
}
