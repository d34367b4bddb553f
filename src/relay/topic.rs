use color_eyre::{eyre::eyre, Result};

const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SUFFIX_LEN: usize = 6;

/// Generate a topic name: `prefix` followed by a short random base36 suffix.
///
/// Convenience only; nothing checks that the topic is unused on the relay.
pub fn generate_topic(prefix: &str) -> Result<String> {
  let mut bytes = [0u8; SUFFIX_LEN];
  getrandom::getrandom(&mut bytes).map_err(|e| eyre!("Failed to gather randomness: {}", e))?;

  let suffix: String = bytes
    .iter()
    .map(|b| ALPHABET[*b as usize % ALPHABET.len()] as char)
    .collect();

  Ok(format!("{}{}", prefix, suffix))
}
