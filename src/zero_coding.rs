//! Run-length byte stuffing ("zero-coding") for packet payloads. Runs of 0x00 bytes are
//!  replaced by 0x00 followed by a count byte; a run longer than 255 emits `00 FF` and starts
//!  over. Only the payload region is coded - callers pass it without the header prefix or the
//!  appended-ack tail, which travel uncoded.

/// Encodes a payload region. The result is only smaller than the input if it contains zero
///  runs, and can be up to twice the input size if it does not.
pub fn zero_encode(src: &[u8]) -> Vec<u8> {
    let mut dest = Vec::with_capacity(src.len());
    let mut zero_count = 0u16;

    for &b in src {
        if b == 0x00 {
            if zero_count == 0xff {
                dest.push(0x00);
                dest.push(0xff);
                zero_count = 0;
            }
            zero_count += 1;
        }
        else {
            if zero_count != 0 {
                dest.push(0x00);
                dest.push(zero_count as u8);
                zero_count = 0;
            }
            dest.push(b);
        }
    }
    if zero_count != 0 {
        dest.push(0x00);
        dest.push(zero_count as u8);
    }

    dest
}

/// Decodes a zero-coded payload region. Fails on a truncated run marker (a trailing 0x00
///  without its count byte).
pub fn zero_decode(src: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut dest = Vec::with_capacity(src.len() * 2);
    let mut i = 0;

    while i < src.len() {
        if src[i] == 0x00 {
            let Some(&count) = src.get(i + 1) else {
                anyhow::bail!("truncated zero-coded run at offset {}", i);
            };
            dest.resize(dest.len() + count as usize, 0x00);
            i += 2;
        }
        else {
            dest.push(src[i]);
            i += 1;
        }
    }

    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(vec![], vec![])]
    #[case::no_zeroes(vec![1, 2, 3], vec![1, 2, 3])]
    #[case::single_zero(vec![0], vec![0, 1])]
    #[case::zero_run(vec![0, 0, 0], vec![0, 3])]
    #[case::mixed(vec![1, 0, 0, 2, 0, 3], vec![1, 0, 2, 2, 0, 1, 3])]
    #[case::trailing_run(vec![7, 0, 0], vec![7, 0, 2])]
    fn test_zero_encode(#[case] src: Vec<u8>, #[case] expected: Vec<u8>) {
        assert_eq!(zero_encode(&src), expected);
    }

    #[test]
    fn test_zero_encode_long_run() {
        let src = vec![0u8; 300];
        let encoded = zero_encode(&src);
        assert_eq!(encoded, vec![0, 255, 0, 45]);
        assert_eq!(zero_decode(&encoded).unwrap(), src);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::no_zeroes(vec![1, 2, 3])]
    #[case::zero_runs(vec![1, 0, 0, 0, 2, 0, 3, 0, 0])]
    #[case::all_zeroes(vec![0; 64])]
    fn test_round_trip(#[case] src: Vec<u8>) {
        assert_eq!(zero_decode(&zero_encode(&src)).unwrap(), src);
    }

    #[test]
    fn test_truncated_run() {
        assert!(zero_decode(&[1, 2, 0]).is_err());
    }
}
