use chrono::Utc;

/// Job id the control plane answers with when it could not accept the
/// publish at all. Distinct from "zero agents matched".
pub const UNREACHABLE_JID: &str = "0";

/// Generate a timestamp-derived job id, unique within the retention window
/// of the job cache (microsecond resolution).
pub fn gen_jid() -> String {
    Utc::now().format("%Y%m%d%H%M%S%6f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jid_is_numeric_timestamp() {
        let jid = gen_jid();
        assert_eq!(jid.len(), 20);
        assert!(jid.chars().all(|c| c.is_ascii_digit()));
        assert_ne!(jid, UNREACHABLE_JID);
    }
}
