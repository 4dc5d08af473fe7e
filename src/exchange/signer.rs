use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{Result, TradeError};

/// HMAC-SHA256 signer, hex output.
///
/// The keyed MAC is built once and cloned per message.
#[derive(Clone)]
pub struct HmacSigner {
    mac: Hmac<Sha256>,
}

impl HmacSigner {
    pub fn new(secret: &str) -> Result<Self> {
        let mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .map_err(|e| TradeError::Authentication(format!("unusable api secret: {e}")))?;
        Ok(Self { mac })
    }

    pub fn sign_hex(&self, message: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

/// `timestamp‖apiKey‖recvWindow‖payload`, the header-signing prehash.
pub fn header_prehash(timestamp: i64, api_key: &str, recv_window: u64, payload: &str) -> String {
    format!("{timestamp}{api_key}{recv_window}{payload}")
}

/// Encodes params in the order given. Signatures cover the exact bytes sent.
pub fn build_query(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        // RFC 4231 test case 2
        let signer = HmacSigner::new("Jefe").unwrap();
        assert_eq!(
            signer.sign_hex("what do ya want for nothing?"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_signer_is_reusable() {
        let signer = HmacSigner::new("secret").unwrap();
        let a = signer.sign_hex("payload");
        let b = signer.sign_hex("payload");
        assert_eq!(a, b);
        assert_ne!(a, signer.sign_hex("payload2"));
    }

    #[test]
    fn test_header_prehash_order() {
        assert_eq!(
            header_prehash(1700000000000, "KEY", 5000, "category=linear"),
            "1700000000000KEY5000category=linear"
        );
    }

    #[test]
    fn test_build_query_encodes_values() {
        let params = vec![
            ("symbol".to_string(), "BTC_USDT".to_string()),
            ("externalOid".to_string(), "tc a/b".to_string()),
        ];
        assert_eq!(build_query(&params), "symbol=BTC_USDT&externalOid=tc%20a%2Fb");
    }
}
