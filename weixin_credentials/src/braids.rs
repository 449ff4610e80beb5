use aliri_braid::braid;
use std::fmt;

macro_rules! limited_reveal {
    ($ty:ty: $hidden:literal, $default:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    f.write_str("\"")?;
                    limited_reveal(&self.0, &mut *f, $default)?;
                    f.write_str("\"")
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    limited_reveal(&self.0, &mut *f, usize::MAX)
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }
    };
}

fn limited_reveal(unprotected: &str, f: &mut fmt::Formatter, default_len: usize) -> fmt::Result {
    let max_len = f.width().unwrap_or(default_len);
    if max_len <= 1 {
        f.write_str("…")
    } else if max_len > unprotected.len() {
        f.write_str(unprotected)
    } else {
        match unprotected.char_indices().nth(max_len - 2) {
            Some((idx, c)) if idx + c.len_utf8() < unprotected.len() => {
                f.write_str(&unprotected[0..idx + c.len_utf8()])?;
                f.write_str("…")
            }
            _ => f.write_str(unprotected),
        }
    }
}

/// The appid of an official account or mini program, or of the platform itself
#[braid(serde)]
pub struct AppId;

/// An app secret issued alongside an appid
#[braid(serde, debug = "owned", display = "owned")]
pub struct AppSecret;

limited_reveal!(AppSecretRef: "APP SECRET", 5);

/// A cached credential value: an access token or a ticket
#[braid(serde, debug = "owned", display = "owned")]
pub struct Secret;

limited_reveal!(SecretRef: "SECRET", 15);

/// An authorizer refresh token, used to renew an authorizer access token
#[braid(serde, debug = "owned", display = "owned")]
pub struct RefreshToken;

limited_reveal!(RefreshTokenRef: "REFRESH TOKEN", 5);

/// The component verify ticket pushed to the platform by Weixin
#[braid(serde, debug = "owned", display = "owned")]
pub struct VerifyTicket;

limited_reveal!(VerifyTicketRef: "VERIFY TICKET", 5);

/// An authorization code returned when an account authorizes the platform
#[braid(serde, debug = "owned", display = "owned")]
pub struct AuthCode;

limited_reveal!(AuthCodeRef: "AUTH CODE", 5);

/// A short-lived code identifying one visit to the authorization page
#[braid(serde, debug = "owned", display = "owned")]
pub struct PreAuthCode;

limited_reveal!(PreAuthCodeRef: "PRE-AUTH CODE", 5);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_redacted_by_default() {
        let secret = Secret::from_static("0123456789abcdefghijklmnop");
        assert_eq!(format!("{:?}", secret), "***SECRET***");
        assert_eq!(format!("{}", secret), "***SECRET***");
    }

    #[test]
    fn alternate_debug_reveals_a_prefix() {
        let secret = Secret::from_static("0123456789abcdefghijklmnop");
        assert_eq!(format!("{:#?}", secret), "\"0123456789abcd…\"");
        assert_eq!(format!("{:#5?}", secret), "\"0123…\"");
    }

    #[test]
    fn alternate_display_reveals_everything() {
        let secret = RefreshToken::from_static("refresh-me");
        assert_eq!(format!("{:#}", secret), "refresh-me");
    }

    #[test]
    fn app_ids_are_not_redacted() {
        let appid = AppId::from_static("wx1234");
        assert_eq!(appid.to_string(), "wx1234");
    }
}
