//! Device ID block generation

use rand::{distributions::Alphanumeric, Rng};
use sha1::{Digest, Sha1};

/// Length of the random token in a device id.
const DEVICE_ID_TOKEN_LEN: usize = 22;

/// Generate a fresh device id under `domain`.
pub fn random_device_id(domain: &str) -> Vec<u8> {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(DEVICE_ID_TOKEN_LEN)
        .map(char::from)
        .collect();
    format!("//{}/d/{}", domain, token).into_bytes()
}

/// Build an ID block for `domain`: the SHA-1 of a freshly generated
/// device id, followed by the id itself, NUL-terminated.
pub fn make_id_block(domain: &str) -> Vec<u8> {
    let id = random_device_id(domain);

    let mut block = Sha1::digest(&id).to_vec();
    block.extend_from_slice(&id);
    block.push(0);
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_block_layout() {
        let block = make_id_block("api.example.com");

        // sha1 || id || NUL
        assert_eq!(*block.last().unwrap(), 0);
        let id = &block[20..block.len() - 1];
        assert_eq!(&block[..20], Sha1::digest(id).as_slice());
        assert!(id.starts_with(b"//api.example.com/d/"));
    }

    #[test]
    fn device_ids_are_unique() {
        assert_ne!(random_device_id("d"), random_device_id("d"));
    }
}
