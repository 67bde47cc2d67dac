//! Mapping of low-level failures onto stable fault categories.
//!
//! TLS and resolver errors surface as nested library errors whose only
//! stable trait is their message, so the last resort is a message match.

use std::error::Error;
use std::io;

use crate::error::{error_chain, TransportFault};

/// Classify a failed request.
pub fn classify_reqwest(err: &reqwest::Error) -> TransportFault {
    let message = error_chain(err);

    if err.is_timeout() {
        return TransportFault::Timeout(message);
    }
    if let Some(status) = err.status() {
        if let Some(fault) = classify_status(status.as_u16()) {
            return fault;
        }
        return TransportFault::UnexpectedStatus {
            status: status.as_u16(),
        };
    }

    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::ConnectionRefused => {
                    return TransportFault::ConnectionRefused(message)
                }
                io::ErrorKind::TimedOut => return TransportFault::Timeout(message),
                _ => {}
            }
        }
        source = cause.source();
    }

    classify_message(&message)
}

/// Classify by message text.
pub fn classify_message(message: &str) -> TransportFault {
    let lower = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&[
        "unknownissuer",
        "unknown issuer",
        "certificate verify failed",
        "self signed",
        "self-signed",
        "unable to find valid certification path",
    ]) {
        TransportFault::UntrustedCertificate(message.to_string())
    } else if has(&["unrecognized_name", "unrecognisedname", "unrecognized name"]) {
        // Checked before the hostname rules: the alert text mentions names too.
        TransportFault::TlsNameRejected(message.to_string())
    } else if has(&["notvalidforname", "not valid for name", "hostname mismatch"]) {
        TransportFault::HostnameMismatch(message.to_string())
    } else if has(&[
        "dns error",
        "failed to lookup address",
        "name or service not known",
        "no such host",
        "nodename nor servname",
    ]) {
        TransportFault::UnknownHost(message.to_string())
    } else if has(&["connection refused"]) {
        TransportFault::ConnectionRefused(message.to_string())
    } else if has(&["timed out", "timeout"]) {
        TransportFault::Timeout(message.to_string())
    } else {
        TransportFault::Other(message.to_string())
    }
}

/// HTTP statuses that always abort an exchange, regardless of body.
pub fn classify_status(status: u16) -> Option<TransportFault> {
    match status {
        400 => Some(TransportFault::BadRequest),
        401 => Some(TransportFault::Unauthorized),
        403 => Some(TransportFault::Forbidden),
        404 => Some(TransportFault::NotFound),
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untrusted_certificate() {
        let fault = classify_message("invalid peer certificate: UnknownIssuer");
        assert_eq!(fault.category(), "untrusted-certificate");
    }

    #[test]
    fn test_hostname_mismatch() {
        let fault = classify_message(
            "invalid peer certificate: NotValidForName",
        );
        assert_eq!(fault.category(), "hostname-mismatch");
    }

    #[test]
    fn test_tls_name_rejected_wins_over_hostname() {
        let fault = classify_message("received fatal alert: UnrecognisedName (not valid for name)");
        assert_eq!(fault.category(), "tls-name-rejected");
    }

    #[test]
    fn test_unknown_host() {
        let fault = classify_message("error sending request: dns error: failed to lookup address information");
        assert_eq!(fault.category(), "unknown-host");
    }

    #[test]
    fn test_connection_refused_and_timeout() {
        assert_eq!(
            classify_message("tcp connect error: Connection refused (os error 111)").category(),
            "connection-refused"
        );
        assert_eq!(classify_message("operation timed out").category(), "timeout");
        assert_eq!(classify_message("something else").category(), "other");
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(400), Some(TransportFault::BadRequest));
        assert_eq!(classify_status(401), Some(TransportFault::Unauthorized));
        assert_eq!(classify_status(403), Some(TransportFault::Forbidden));
        assert_eq!(classify_status(404), Some(TransportFault::NotFound));
        assert_eq!(classify_status(500), None);
        assert_eq!(classify_status(200), None);
    }
}
