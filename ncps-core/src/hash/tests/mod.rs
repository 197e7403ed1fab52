use super::*;

use crate::error::CoreError;

const BLOB: &[u8] = b"hello world, this is a test blob for hashing";

#[test]
fn test_basic() {
    let hash = Hash::sha256_from_bytes(BLOB);
    assert_eq!("sha256", hash.hash_type());
    assert_eq!(64, hash.to_hex().len());
}

#[test]
fn test_blake3_basic() {
    let hash = Hash::blake3_from_bytes(BLOB);
    assert_eq!("blake3", hash.hash_type());
    assert_eq!(64, hash.to_hex().len());

    // BLAKE3 is deterministic.
    let hash2 = Hash::blake3_from_bytes(BLOB);
    assert_eq!(hash.to_hex(), hash2.to_hex());
}

#[test]
fn test_from_typed() {
    let base16 = "sha256:baeabdb75c223d171800c17b05c5e7e8e9980723a90eb6ffcc632a305afc5a42";
    let base32 = "sha256:0hjszid30ak3rkzvc3m94c3risg8wz2hayy100c1fg92bjvvvsms";

    assert_eq!(
        Hash::from_typed(base16).unwrap(),
        Hash::from_typed(base32).unwrap()
    );

    assert!(matches!(
        Hash::from_typed("sha256"),
        Err(CoreError::HashError(Error::NoColonSeparator))
    ));

    assert!(matches!(
        Hash::from_typed("sha256:"),
        Err(CoreError::HashError(Error::InvalidHashStringLength { .. }))
    ));

    assert!(matches!(
        Hash::from_typed("sha256:eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee"),
        Err(CoreError::HashError(Error::InvalidBase32Hash))
    ));

    assert!(matches!(
        Hash::from_typed("sha256:gggggggggggggggggggggggggggggggggggggggggggggggggggggggggggggggg"),
        Err(CoreError::HashError(Error::InvalidBase16Hash(_)))
    ));

    assert!(matches!(
        Hash::from_typed("md5:invalid"),
        Err(CoreError::HashError(Error::UnsupportedHashAlgorithm(alg))) if alg == "md5"
    ));
}

#[test]
fn test_blake3_roundtrip() {
    let hash = Hash::blake3_from_bytes(BLOB);
    let typed = hash.to_typed_base16();
    let parsed = Hash::from_typed(&typed).unwrap();
    assert_eq!(hash, parsed);
}
