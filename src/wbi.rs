//! WBI request signing.
//!
//! Every protected endpoint requires its query parameters to be signed with
//! a pair of short-lived keys published by the platform. The scheme:
//!
//! 1. Concatenate the two keys and interleave the result through a fixed
//!    64-entry permutation table; the first 32 characters form the mixin key.
//! 2. Insert the current epoch seconds as `wts`.
//! 3. Sort parameters by key (byte-wise ascending) and strip the characters
//!    `!'()*` from every value.
//! 4. Form-urlencode the sorted parameters and take the MD5 digest of
//!    `query + mixin_key`, hex encoded, as `w_rid`.
//!
//! Signing is a pure function of the parameters, the key material and the
//! clock, which keeps it reproducible under test.

use std::collections::BTreeMap;

use md5::{Digest, Md5};

/// The two signing key strings, refreshed together via the discovery
/// endpoint.
///
/// Both fields are always present; when signing material could not be
/// obtained the cache holds no `SigningKeys` at all.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningKeys {
    pub img_key: String,
    pub sub_key: String,
}

/// Fixed permutation table of the signing protocol.
///
/// A public constant: indexes into the concatenated key material.
const MIXIN_KEY_ENC_TAB: [usize; 64] = [
    46, 47, 18, 2, 53, 8, 23, 32, 15, 50, 10, 31, 58, 3, 45, 35, 27, 43, 5, 49, 33, 9, 42, 19, 29,
    28, 14, 39, 12, 38, 41, 13, 37, 48, 7, 16, 24, 55, 40, 61, 26, 17, 0, 1, 60, 51, 30, 4, 22,
    25, 54, 21, 56, 59, 6, 63, 57, 62, 11, 36, 20, 34, 44, 52,
];

/// Characters stripped from parameter values before signing.
const FILTERED_CHARS: &[char] = &['!', '\'', '(', ')', '*'];

/// Derives the 32-character mixin key from the concatenated key material.
fn mixin_key(orig: &str) -> String {
    let chars: Vec<char> = orig.chars().collect();
    MIXIN_KEY_ENC_TAB
        .iter()
        .filter_map(|&i| chars.get(i))
        .take(32)
        .collect()
}

/// Signs a parameter map.
///
/// Returns the parameters augmented with `wts` (the supplied timestamp in
/// epoch seconds) and `w_rid` (the hex digest). Values are returned with
/// the filtered characters removed, exactly as they were signed.
#[must_use]
pub fn sign(
    params: &BTreeMap<String, String>,
    keys: &SigningKeys,
    now: u64,
) -> BTreeMap<String, String> {
    let mixin = mixin_key(&format!("{}{}", keys.img_key, keys.sub_key));

    let mut signed: BTreeMap<String, String> = params
        .iter()
        .map(|(k, v)| {
            let filtered: String = v.chars().filter(|c| !FILTERED_CHARS.contains(c)).collect();
            (k.clone(), filtered)
        })
        .collect();
    signed.insert("wts".to_owned(), now.to_string());

    // BTreeMap iteration is already byte-wise ascending by key.
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in &signed {
        serializer.append_pair(k, v);
    }
    let query = serializer.finish();

    let digest = Md5::digest(format!("{query}{mixin}").as_bytes());
    let w_rid = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
    signed.insert("w_rid".to_owned(), w_rid);

    signed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> SigningKeys {
        SigningKeys {
            img_key: "7cd084941338484aae1ad9425b84077c".to_owned(),
            sub_key: "4932caff0ff746eab6f01bf08b70ac45".to_owned(),
        }
    }

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn mixin_key_takes_32_permuted_chars() {
        let mixed = mixin_key(&format!("{}{}", keys().img_key, keys().sub_key));
        assert_eq!(mixed.len(), 32);
        // First table entry is 46: character 46 of the concatenated keys.
        assert_eq!(mixed.chars().next(), "7cd084941338484aae1ad9425b84077c4932caff0ff746eab6f01bf08b70ac45".chars().nth(46));
    }

    #[test]
    fn sign_is_deterministic() {
        let p = params(&[("bvid", "BV1xx411c7mD"), ("cid", "12345"), ("qn", "80")]);
        let a = sign(&p, &keys(), 1_700_000_000);
        let b = sign(&p, &keys(), 1_700_000_000);
        assert_eq!(a, b);
    }

    #[test]
    fn sign_adds_wts_and_w_rid() {
        let p = params(&[("bvid", "BV1xx411c7mD")]);
        let signed = sign(&p, &keys(), 1_700_000_000);
        assert_eq!(signed.get("wts").map(String::as_str), Some("1700000000"));
        let w_rid = signed.get("w_rid").expect("w_rid missing");
        assert_eq!(w_rid.len(), 32);
        assert!(w_rid.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn sign_strips_filtered_chars_from_values() {
        let p = params(&[("keyword", "it's (a) test!*")]);
        let signed = sign(&p, &keys(), 1_700_000_000);
        assert_eq!(signed.get("keyword").map(String::as_str), Some("its a test"));
    }

    #[test]
    fn sign_ignores_input_order() {
        let forward = params(&[("a", "1"), ("b", "2"), ("z", "3")]);
        let mut reversed = BTreeMap::new();
        for (k, v) in [("z", "3"), ("b", "2"), ("a", "1")] {
            reversed.insert(k.to_owned(), v.to_owned());
        }
        let now = 1_700_000_000;
        assert_eq!(
            sign(&forward, &keys(), now).get("w_rid"),
            sign(&reversed, &keys(), now).get("w_rid")
        );
    }

    #[test]
    fn timestamp_changes_signature() {
        let p = params(&[("bvid", "BV1xx411c7mD")]);
        let a = sign(&p, &keys(), 1_700_000_000);
        let b = sign(&p, &keys(), 1_700_000_001);
        assert_ne!(a.get("w_rid"), b.get("w_rid"));
    }
}
