use super::*;

fn roundtrip<T: Encode + Decode + PartialEq + std::fmt::Debug>(value: T) {
    let bytes = encode_to_vec(&value).unwrap();
    let (decoded, consumed) = decode_from_slice::<T>(&bytes).unwrap();
    assert_eq!(consumed, bytes.len());
    assert_eq!(value, decoded);
}

#[test]
fn roundtrips_integers() {
    roundtrip(0u8);
    roundtrip(255u8);
    roundtrip(0u32);
    roundtrip(u32::MAX);
    roundtrip(0u64);
    roundtrip(u64::MAX);
    roundtrip(i64::MIN);
    roundtrip(i64::MAX);
}

#[test]
fn roundtrips_bool_and_arrays() {
    roundtrip(true);
    roundtrip(false);
    roundtrip([1u8, 2, 3, 4]);
}

#[test]
fn roundtrips_bytes_and_strings() {
    roundtrip(Vec::<u8>::new());
    roundtrip(b"hello world".to_vec());
    roundtrip(String::from("seqstore"));
    roundtrip(std::path::PathBuf::from("/tmp/table/sst/000001.sst"));
}

#[test]
fn vec_helper_roundtrips() {
    let items: Vec<u64> = vec![1, 2, 3, 4, 5];
    let mut buf = Vec::new();
    encode_vec(&items, &mut buf).unwrap();
    let (decoded, consumed) = decode_vec::<u64>(&buf).unwrap();
    assert_eq!(consumed, buf.len());
    assert_eq!(items, decoded);
}

#[test]
fn rejects_truncated_buffer() {
    let err = u64::decode_from(&[1, 2, 3]).unwrap_err();
    assert!(matches!(err, EncodingError::UnexpectedEof { .. }));
}

#[test]
fn rejects_invalid_bool() {
    let err = bool::decode_from(&[7]).unwrap_err();
    assert!(matches!(err, EncodingError::InvalidBool(7)));
}

#[test]
fn rejects_oversized_byte_vector_length() {
    let mut buf = Vec::new();
    (MAX_BYTE_LEN + 1).encode_to(&mut buf).unwrap();
    let err = Vec::<u8>::decode_from(&buf).unwrap_err();
    assert!(matches!(err, EncodingError::LengthOverflow(_)));
}
