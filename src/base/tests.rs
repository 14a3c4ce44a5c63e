use crate::base::neterror::{ErrorClass, NetError};
use std::io;

#[test]
fn test_net_error_roundtrip() {
    // Standard Chromium error
    let original = NetError::ConnectionRefused;
    let code = original.as_i32();
    assert_eq!(code, -102);
    let converted = NetError::from(code);
    assert!(matches!(converted, NetError::ConnectionRefused));

    // Custom error
    let custom = NetError::RedirectCycleDetected;
    let custom_code = custom.as_i32();
    assert_eq!(custom_code, -10000);
    let custom_converted = NetError::from(custom_code);
    assert!(matches!(custom_converted, NetError::RedirectCycleDetected));
}

#[test]
fn test_unknown_error() {
    let err = NetError::from(-9999);
    assert!(matches!(err, NetError::Unknown(-9999)));
    assert_eq!(err.code(), -9999);
}

#[test]
fn test_collision_avoidance() {
    // Blob errors occupy -900..=-906 in Chromium's net_error_list.h
    let blob_range = -906..=-900;

    for err in [
        NetError::RedirectCycleDetected,
        NetError::SocketRemoteClosed,
        NetError::InvalidHeader,
        NetError::ConflictingFraming,
        NetError::UnsupportedProtocol,
    ] {
        assert!(!blob_range.contains(&err.as_i32()), "{err:?}");
    }
}

#[test]
fn test_error_classes() {
    assert_eq!(NetError::NameNotResolved.class(), ErrorClass::ResolutionFailure);
    assert_eq!(NetError::ConnectionRefused.class(), ErrorClass::ConnectFailure);
    assert_eq!(NetError::InvalidChunkedEncoding.class(), ErrorClass::ProtocolError);
    assert_eq!(NetError::TooManyRedirects.class(), ErrorClass::ProtocolError);
    assert_eq!(NetError::ConnectionTimedOut.class(), ErrorClass::Timeout);
    assert_eq!(NetError::Aborted.class(), ErrorClass::Cancelled);
    assert_eq!(NetError::ConnectionReset.class(), ErrorClass::Other);
    assert!(NetError::ConflictingFraming.is_protocol_error());
}

#[test]
fn test_context_variants_keep_codes() {
    let err = NetError::connection_failed_to("example.com", 80, io::ErrorKind::Other.into());
    assert_eq!(err.as_i32(), NetError::ConnectionFailed.as_i32());
    assert_eq!(err.class(), ErrorClass::ConnectFailure);
    assert!(err.to_string().contains("example.com:80"));

    let err = NetError::dns_failed("nowhere.invalid", io::ErrorKind::NotFound.into());
    assert_eq!(err.as_i32(), -105);
    assert_eq!(err.class(), ErrorClass::ResolutionFailure);
}

#[test]
fn test_from_io_error() {
    let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
    assert!(matches!(NetError::from(refused), NetError::ConnectionRefused));
    let reset = io::Error::from(io::ErrorKind::ConnectionReset);
    assert!(matches!(NetError::from(reset), NetError::ConnectionReset));
}
