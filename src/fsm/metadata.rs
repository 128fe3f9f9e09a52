//! Metadata sidecar codec (`spec.md` §4.D "Set-Metadata / Get-Metadata"):
//! `<name>-m`, records separated by `\x01`, key and value separated by
//! `\x02` within a record.

const RECORD_SEP: char = '\x01';
const KV_SEP: char = '\x02';

/// How `Set-Metadata` combines new pairs with whatever is already stored
/// (FastDFS's `STORAGE_SET_METADATA_FLAG_OVERWRITE`/`_MERGE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMetadataFlag {
    Overwrite,
    Merge,
}

impl SetMetadataFlag {
    pub fn from_byte(byte: u8) -> SetMetadataFlag {
        match byte {
            b'M' => SetMetadataFlag::Merge,
            _ => SetMetadataFlag::Overwrite,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            SetMetadataFlag::Overwrite => b'O',
            SetMetadataFlag::Merge => b'M',
        }
    }
}

/// Renders key/value pairs into the sidecar's on-disk bytes.
pub fn encode(pairs: &[(String, String)]) -> Vec<u8> {
    let mut out = String::new();
    for (i, (k, v)) in pairs.iter().enumerate() {
        if i > 0 {
            out.push(RECORD_SEP);
        }
        out.push_str(k);
        out.push(KV_SEP);
        out.push_str(v);
    }
    out.into_bytes()
}

/// Parses sidecar bytes into key/value pairs. Malformed records (missing
/// the `\x02` separator) are skipped rather than failing the whole blob,
/// matching the receive side being purely additive state.
pub fn decode(bytes: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(bytes);
    text.split(RECORD_SEP)
        .filter(|record| !record.is_empty())
        .filter_map(|record| record.split_once(KV_SEP))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Applies `Set-Metadata` semantics: `Overwrite` replaces the whole blob;
/// `Merge` keeps existing keys not present in `incoming` and lets
/// `incoming` entries win on collision.
pub fn apply(existing: &[(String, String)], incoming: &[(String, String)], flag: SetMetadataFlag) -> Vec<(String, String)> {
    match flag {
        SetMetadataFlag::Overwrite => incoming.to_vec(),
        SetMetadataFlag::Merge => {
            let mut merged: Vec<(String, String)> =
                existing.iter().filter(|(k, _)| !incoming.iter().any(|(ik, _)| ik == k)).cloned().collect();
            merged.extend(incoming.iter().cloned());
            merged
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_round_trips() {
        let pairs = vec![("width".to_string(), "100".to_string()), ("height".to_string(), "200".to_string())];
        let decoded = decode(&encode(&pairs));
        assert_eq!(decoded, pairs);
    }

    #[test]
    fn overwrite_replaces_everything() {
        let existing = vec![("a".to_string(), "1".to_string())];
        let incoming = vec![("b".to_string(), "2".to_string())];
        let result = apply(&existing, &incoming, SetMetadataFlag::Overwrite);
        assert_eq!(result, incoming);
    }

    #[test]
    fn merge_keeps_untouched_keys_and_overwrites_collisions() {
        let existing = vec![("a".to_string(), "1".to_string()), ("b".to_string(), "old".to_string())];
        let incoming = vec![("b".to_string(), "new".to_string())];
        let result = apply(&existing, &incoming, SetMetadataFlag::Merge);
        assert!(result.contains(&("a".to_string(), "1".to_string())));
        assert!(result.contains(&("b".to_string(), "new".to_string())));
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn flag_byte_round_trips() {
        assert_eq!(SetMetadataFlag::from_byte(b'M'), SetMetadataFlag::Merge);
        assert_eq!(SetMetadataFlag::from_byte(b'O'), SetMetadataFlag::Overwrite);
    }
}
