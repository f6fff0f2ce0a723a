//! Session id generation and local host identification.

use crate::time::now_ts;

/// `<millis-since-epoch>-<12 hex chars>`: monotonically prefixed, uniqueness
/// from the random suffix.
pub fn new_session_id() -> String {
    let millis = (now_ts() * 1000.0) as i64;
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{millis}-{}", &suffix[..12])
}

pub fn host_name() -> String {
    hostname_from_uname().unwrap_or_else(|| "unknown".to_string())
}

fn hostname_from_uname() -> Option<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Some(String::from_utf8_lossy(&buf[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_have_millis_prefix_and_hex_suffix() {
        let id = new_session_id();
        let (prefix, suffix) = id.split_once('-').unwrap();
        assert!(prefix.parse::<i64>().is_ok());
        assert_eq!(suffix.len(), 12);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(new_session_id(), new_session_id());
    }

    #[test]
    fn host_name_is_non_empty() {
        assert!(!host_name().is_empty());
    }
}
