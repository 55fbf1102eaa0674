#![forbid(unsafe_code)]
//! Property test: a cached handle behaves exactly like a plain byte vector.
//!
//! Random sequences of positioned reads and writes run against a `PagedFile`
//! with a deliberately tiny cache (so evictions and reloads happen
//! constantly) and against a `Vec<u8>` shadow model; every read and the
//! final on-disk image must agree.

use pagelab_file::PagedFile;
use pagelab_types::PageSize;
use proptest::prelude::*;
use std::io::SeekFrom;

const MAX_OFFSET: u64 = 40_000;
const MAX_IO: usize = 2_000;

#[derive(Debug, Clone)]
enum Op {
    Write { offset: u64, data: Vec<u8> },
    Read { offset: u64, len: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..MAX_OFFSET, proptest::collection::vec(any::<u8>(), 1..MAX_IO))
            .prop_map(|(offset, data)| Op::Write { offset, data }),
        (0..MAX_OFFSET, 1..MAX_IO)
            .prop_map(|(offset, len)| Op::Read { offset, len }),
    ]
}

fn model_write(model: &mut Vec<u8>, offset: u64, data: &[u8]) {
    let offset = usize::try_from(offset).unwrap();
    let end = offset + data.len();
    if model.len() < end {
        model.resize(end, 0);
    }
    model[offset..end].copy_from_slice(data);
}

fn model_read(model: &[u8], offset: u64, len: usize) -> Vec<u8> {
    let offset = usize::try_from(offset).unwrap();
    if offset >= model.len() {
        return Vec::new();
    }
    let end = model.len().min(offset + len);
    model[offset..end].to_vec()
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 24, ..ProptestConfig::default() })]

    #[test]
    fn random_io_matches_byte_vector_model(ops in proptest::collection::vec(op_strategy(), 1..60)) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");

        let mut file = PagedFile::options()
            .read(true)
            .write(true)
            .create(true)
            .cache_pages(4)
            .page_size(PageSize::new(4096).unwrap())
            .open(&path)
            .unwrap();
        let mut model: Vec<u8> = Vec::new();

        for op in &ops {
            match op {
                Op::Write { offset, data } => {
                    file.seek(SeekFrom::Start(*offset)).unwrap();
                    prop_assert_eq!(file.write(data).unwrap(), data.len());
                    model_write(&mut model, *offset, data);
                    prop_assert_eq!(file.len(), model.len() as u64);
                }
                Op::Read { offset, len } => {
                    file.seek(SeekFrom::Start(*offset)).unwrap();
                    let mut buf = vec![0_u8; *len];
                    let n = file.read(&mut buf).unwrap();
                    let expected = model_read(&model, *offset, *len);
                    prop_assert_eq!(n, expected.len());
                    prop_assert_eq!(&buf[..n], &expected[..]);
                }
            }
        }

        file.close().unwrap();
        let on_disk = std::fs::read(&path).unwrap();
        prop_assert_eq!(on_disk, model);
    }
}
