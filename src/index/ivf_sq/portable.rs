//! Portable snapshot of a complete IVF-SQ index and its binary encoding.
//!
//! A [`PortableIndex`] holds everything needed to rebuild a resident index
//! in another [`Resources`] context: shape, codec configuration, centroids,
//! codec parameters and every list in append order. Rebuilding from a
//! snapshot and snapshotting again yields an equal snapshot.
//!
//! ## Binary layout (little endian)
//!
//! ```text
//! [magic: u32 "IwSq"][format_version: u32]
//! [dims: u32][nlist: u32][nprobe: u32][metric: u8][trained: u8]
//! [bits: u8][storage: u8][range_stat: u8][by_residual: u8][range_stat_arg: f32]
//! [has_params: u8] ([vmin: f32 * dims][vdiff: f32 * dims])?
//! [centroid_count: u32][f32 * centroid_count * dims]
//! nlist x ([count: u64][ids: i64 * count][codes: u8 * count * code_size])
//! [checksum: u64]   xxh3_64 of every preceding byte
//! ```

use std::io::{Read, Write};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use xxhash_rust::xxh3::xxh3_64;

use crate::config::CodecConfig;
use crate::error::{IvfSqError, Result};
use crate::index::quantization::{CodecParams, RangeStat, ScalarQuantizer, StoragePrecision};
use crate::resources::Resources;
use crate::types::{DistanceMetric, VectorId};

use super::IvfSqIndex;

/// `"IwSq"` read as a little-endian u32.
pub const PORTABLE_MAGIC: u32 = u32::from_le_bytes(*b"IwSq");
pub const PORTABLE_FORMAT_VERSION: u32 = 1;

/// Header plus the `has_params` flag and centroid count.
const FIXED_LEN: usize = 35;
const CHECKSUM_LEN: usize = 8;

/// Entries of one inverted list in append order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortableList {
    pub ids: Vec<VectorId>,
    /// `ids.len() * code_size` bytes.
    pub codes: Vec<u8>,
}

/// Self-describing snapshot of an [`IvfSqIndex`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortableIndex {
    pub format_version: u32,
    pub dims: usize,
    pub nlist: usize,
    pub nprobe: usize,
    pub metric: DistanceMetric,
    pub trained: bool,
    pub codec: CodecConfig,
    /// Present exactly when `trained` is set.
    pub codec_params: Option<CodecParams>,
    /// `nlist * dims` floats when trained, empty otherwise.
    pub centroids: Vec<f32>,
    pub lists: Vec<PortableList>,
}

impl PortableIndex {
    pub fn code_size(&self) -> usize {
        ScalarQuantizer::code_size_for(self.dims, &self.codec)
    }

    pub fn total_count(&self) -> usize {
        self.lists.iter().map(|l| l.ids.len()).sum()
    }

    /// Check internal consistency; every failure is a format error.
    pub fn validate(&self) -> Result<()> {
        if self.format_version != PORTABLE_FORMAT_VERSION {
            return Err(format_err(format!(
                "unsupported format version {}",
                self.format_version
            )));
        }
        if self.dims == 0 || self.nlist == 0 {
            return Err(format_err(format!(
                "invalid shape: dims {}, nlist {}",
                self.dims, self.nlist
            )));
        }
        if self.nprobe == 0 || self.nprobe > self.nlist {
            return Err(format_err(format!(
                "nprobe {} outside 1..={}",
                self.nprobe, self.nlist
            )));
        }
        self.codec
            .validate()
            .map_err(|e| format_err(format!("codec: {e}")))?;

        match (self.trained, &self.codec_params) {
            (true, Some(params)) => {
                if params.vmin.len() != self.dims || params.vdiff.len() != self.dims {
                    return Err(format_err("codec params do not match dims".into()));
                }
                if self.centroids.len() != self.nlist * self.dims {
                    return Err(format_err(format!(
                        "{} centroid floats, expected {}",
                        self.centroids.len(),
                        self.nlist * self.dims
                    )));
                }
                if self.centroids.iter().any(|v| !v.is_finite()) {
                    return Err(format_err("centroids contain non-finite values".into()));
                }
                if params.vmin.iter().any(|v| !v.is_finite())
                    || params.vdiff.iter().any(|v| !v.is_finite() || *v < 0.0)
                {
                    return Err(format_err("codec params contain invalid ranges".into()));
                }
            }
            (false, None) => {
                if !self.centroids.is_empty() {
                    return Err(format_err("untrained snapshot carries centroids".into()));
                }
            }
            (true, None) => return Err(format_err("trained snapshot lacks codec params".into())),
            (false, Some(_)) => {
                return Err(format_err("untrained snapshot carries codec params".into()))
            }
        }

        if self.lists.len() != self.nlist {
            return Err(format_err(format!(
                "{} lists, expected {}",
                self.lists.len(),
                self.nlist
            )));
        }
        let code_size = self.code_size();
        for (i, list) in self.lists.iter().enumerate() {
            if list.codes.len() != list.ids.len() * code_size {
                return Err(format_err(format!(
                    "list {i}: {} code bytes for {} ids",
                    list.codes.len(),
                    list.ids.len()
                )));
            }
        }
        if !self.trained && self.total_count() > 0 {
            return Err(format_err("untrained snapshot holds vectors".into()));
        }
        Ok(())
    }

    /// Encode to the binary transfer format.
    pub fn to_bytes(&self) -> Bytes {
        let code_size = self.code_size();
        let body_len = FIXED_LEN
            + self.centroids.len() * 4
            + self
                .codec_params
                .as_ref()
                .map_or(0, |p| (p.vmin.len() + p.vdiff.len()) * 4)
            + self
                .lists
                .iter()
                .map(|l| 8 + l.ids.len() * (8 + code_size))
                .sum::<usize>();
        let mut buf = BytesMut::with_capacity(body_len + CHECKSUM_LEN);

        buf.put_u32_le(PORTABLE_MAGIC);
        buf.put_u32_le(self.format_version);
        buf.put_u32_le(self.dims as u32);
        buf.put_u32_le(self.nlist as u32);
        buf.put_u32_le(self.nprobe as u32);
        buf.put_u8(self.metric.to_u8());
        buf.put_u8(self.trained as u8);
        buf.put_u8(self.codec.bits_per_dimension);
        buf.put_u8(self.codec.storage_precision.to_u8());
        buf.put_u8(self.codec.range_stat.to_u8());
        buf.put_u8(self.codec.by_residual as u8);
        buf.put_f32_le(self.codec.range_stat_arg);

        match &self.codec_params {
            Some(params) => {
                buf.put_u8(1);
                for &v in params.vmin.iter().chain(params.vdiff.iter()) {
                    buf.put_f32_le(v);
                }
            }
            None => buf.put_u8(0),
        }

        let centroid_count = if self.dims == 0 {
            0
        } else {
            self.centroids.len() / self.dims
        };
        buf.put_u32_le(centroid_count as u32);
        for &v in &self.centroids {
            buf.put_f32_le(v);
        }

        for list in &self.lists {
            buf.put_u64_le(list.ids.len() as u64);
            for &id in &list.ids {
                buf.put_i64_le(id);
            }
            buf.put_slice(&list.codes);
        }

        let checksum = xxh3_64(&buf);
        buf.put_u64_le(checksum);
        buf.freeze()
    }

    /// Decode and validate a binary snapshot.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < CHECKSUM_LEN {
            return Err(format_err(format!("snapshot too short: {} bytes", data.len())));
        }
        let (body, mut trailer) = data.split_at(data.len() - CHECKSUM_LEN);
        let stored = trailer.get_u64_le();
        let actual = xxh3_64(body);
        if stored != actual {
            return Err(format_err(format!(
                "checksum mismatch: stored {stored:#018x}, computed {actual:#018x}"
            )));
        }

        let mut r = Reader { buf: body };
        let magic = r.u32()?;
        if magic != PORTABLE_MAGIC {
            return Err(format_err(format!("bad magic {magic:#010x}")));
        }
        let format_version = r.u32()?;
        if format_version != PORTABLE_FORMAT_VERSION {
            return Err(format_err(format!(
                "unsupported format version {format_version}"
            )));
        }
        let dims = r.u32()? as usize;
        let nlist = r.u32()? as usize;
        let nprobe = r.u32()? as usize;
        let metric = DistanceMetric::from_u8(r.u8()?)
            .ok_or_else(|| format_err("unknown metric".into()))?;
        let trained = r.flag()?;
        let bits_per_dimension = r.u8()?;
        let storage_precision = StoragePrecision::from_u8(r.u8()?)
            .ok_or_else(|| format_err("unknown storage precision".into()))?;
        let range_stat =
            RangeStat::from_u8(r.u8()?).ok_or_else(|| format_err("unknown range stat".into()))?;
        let by_residual = r.flag()?;
        let range_stat_arg = r.f32()?;
        let codec = CodecConfig {
            bits_per_dimension,
            storage_precision,
            range_stat,
            range_stat_arg,
            by_residual,
        };
        if dims == 0 {
            return Err(format_err("dims must be > 0".into()));
        }

        let codec_params = if r.flag()? {
            let vmin = r.f32_vec(dims)?;
            let vdiff = r.f32_vec(dims)?;
            Some(CodecParams { vmin, vdiff })
        } else {
            None
        };

        let centroid_count = r.u32()? as usize;
        let centroids = r.f32_vec(centroid_count.saturating_mul(dims))?;

        let code_size = ScalarQuantizer::code_size_for(dims, &codec);
        let mut lists = Vec::with_capacity(nlist.min(r.remaining() / 8));
        for _ in 0..nlist {
            let count = usize::try_from(r.u64()?)
                .map_err(|_| format_err("list length overflows usize".into()))?;
            let entry_bytes = 8 + code_size;
            if count.saturating_mul(entry_bytes) > r.remaining() {
                return Err(format_err(format!(
                    "list of {count} entries exceeds remaining {} bytes",
                    r.remaining()
                )));
            }
            let ids = (0..count).map(|_| r.i64()).collect::<Result<Vec<_>>>()?;
            let codes = r.bytes(count * code_size)?.to_vec();
            lists.push(PortableList { ids, codes });
        }
        if r.remaining() != 0 {
            return Err(format_err(format!(
                "{} trailing bytes after last list",
                r.remaining()
            )));
        }

        let snapshot = Self {
            format_version,
            dims,
            nlist,
            nprobe,
            metric,
            trained,
            codec,
            codec_params,
            centroids,
            lists,
        };
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Write the binary encoding to `writer`.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let bytes = self.to_bytes();
        writer.write_all(&bytes)?;
        writer.flush()?;
        debug!(bytes = bytes.len(), "wrote portable index");
        Ok(())
    }

    /// Read a binary snapshot from `reader` until end of stream.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        debug!(bytes = data.len(), "read portable index");
        Self::from_bytes(&data)
    }
}

fn format_err(msg: String) -> IvfSqError {
    IvfSqError::Format(msg)
}

/// Bounds-checked little-endian cursor.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(format_err(format!(
                "truncated snapshot: need {n} bytes, {} left",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn flag(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(format_err(format!("invalid flag byte {v}"))),
        }
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64_le())
    }

    fn f32(&mut self) -> Result<f32> {
        self.need(4)?;
        Ok(self.buf.get_f32_le())
    }

    fn f32_vec(&mut self, n: usize) -> Result<Vec<f32>> {
        self.need(n.saturating_mul(4))?;
        Ok((0..n).map(|_| self.buf.get_f32_le()).collect())
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let buf: &'a [u8] = self.buf;
        let (head, tail) = buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }
}

impl IvfSqIndex {
    /// Snapshot the full index state.
    pub fn to_portable(&self) -> PortableIndex {
        let lists = (0..self.nlist)
            .map(|l| PortableList {
                ids: self.lists.ids(l).to_vec(),
                codes: self.lists.codes(l).to_vec(),
            })
            .collect();
        PortableIndex {
            format_version: PORTABLE_FORMAT_VERSION,
            dims: self.dims,
            nlist: self.nlist,
            nprobe: self.nprobe,
            metric: self.metric,
            trained: self.trained,
            codec: self.codec,
            codec_params: self.quantizer.as_ref().map(|q| q.params().clone()),
            centroids: self.centroids.clone(),
            lists,
        }
    }

    /// Rebuild a resident index from a snapshot inside `resources`.
    ///
    /// Malformed snapshots fail with a format error; list storage is charged
    /// to the new context and may fail with `OutOfMemory`. No partially
    /// built index escapes on failure.
    pub fn from_portable(snapshot: &PortableIndex, resources: Arc<Resources>) -> Result<Self> {
        snapshot.validate()?;

        let mut index = IvfSqIndex::new(
            snapshot.dims,
            snapshot.nlist,
            snapshot.metric,
            snapshot.codec,
            resources,
        )
        .map_err(|e| format_err(e.to_string()))?;
        index
            .set_nprobe(snapshot.nprobe)
            .map_err(|e| format_err(e.to_string()))?;

        if let Some(params) = &snapshot.codec_params {
            let quantizer =
                ScalarQuantizer::from_params(snapshot.dims, &snapshot.codec, params.clone())
                    .map_err(|e| format_err(e.to_string()))?;
            index.centroids = snapshot.centroids.clone();
            index.quantizer = Some(quantizer);
            index.trained = true;
        }

        for (list_id, list) in snapshot.lists.iter().enumerate() {
            if !list.ids.is_empty() {
                index
                    .lists
                    .load_list(list_id, &list.ids, &list.codes, &index.resources)?;
            }
        }

        info!(
            dims = snapshot.dims,
            nlist = snapshot.nlist,
            total = index.total_count(),
            "rebuilt index from portable snapshot"
        );
        Ok(index)
    }

    /// Replace this index with the contents of `snapshot`, keeping this
    /// index's resources and centroid trainer. On error `self` is unchanged.
    pub fn copy_from(&mut self, snapshot: &PortableIndex) -> Result<()> {
        let mut rebuilt = Self::from_portable(snapshot, Arc::clone(&self.resources))?;
        rebuilt.training = self.training.clone();
        rebuilt.trainer = Arc::clone(&self.trainer);
        *self = rebuilt;
        Ok(())
    }

    /// Overwrite `snapshot` with this index's state.
    pub fn copy_to(&self, snapshot: &mut PortableIndex) {
        *snapshot = self.to_portable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn populated(codec: CodecConfig) -> IvfSqIndex {
        let mut idx =
            IvfSqIndex::new(3, 2, DistanceMetric::L2, codec, Resources::unbounded()).unwrap();
        let train: Vec<f32> = (0..30).map(|i| (i % 7) as f32 - 3.0).collect();
        idx.train(&train).unwrap();
        idx.add(&train[..18]).unwrap();
        idx
    }

    #[test]
    fn test_magic_spells_iwsq() {
        assert_eq!(&PORTABLE_MAGIC.to_le_bytes(), b"IwSq");
    }

    #[test]
    fn test_snapshot_roundtrip_equal() {
        let idx = populated(CodecConfig::quantized(6));
        let snap = idx.to_portable();
        snap.validate().unwrap();
        assert_eq!(snap.total_count(), 6);

        let rebuilt = IvfSqIndex::from_portable(&snap, Resources::unbounded()).unwrap();
        assert_eq!(rebuilt.to_portable(), snap);
    }

    #[test]
    fn test_bytes_roundtrip_equal() {
        let idx = populated(CodecConfig::float16().with_residual(true));
        let snap = idx.to_portable();
        let decoded = PortableIndex::from_bytes(&snap.to_bytes()).unwrap();
        assert_eq!(decoded, snap);
    }

    #[test]
    fn test_untrained_snapshot_roundtrip() {
        let idx = IvfSqIndex::new(
            5,
            3,
            DistanceMetric::InnerProduct,
            CodecConfig::default(),
            Resources::unbounded(),
        )
        .unwrap();
        let snap = idx.to_portable();
        assert!(!snap.trained);
        let decoded = PortableIndex::from_bytes(&snap.to_bytes()).unwrap();
        let rebuilt = IvfSqIndex::from_portable(&decoded, Resources::unbounded()).unwrap();
        assert!(!rebuilt.is_trained());
        assert_eq!(rebuilt.metric(), DistanceMetric::InnerProduct);
    }

    #[test]
    fn test_non_finite_centroids_rejected() {
        let mut snap = populated(CodecConfig::default()).to_portable();
        snap.centroids[1] = f32::NAN;
        // The checksum covers the NaN, so only validation can catch it.
        let err = PortableIndex::from_bytes(&snap.to_bytes()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FormatError);

        snap.centroids[1] = f32::INFINITY;
        let err = IvfSqIndex::from_portable(&snap, Resources::unbounded()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FormatError);
    }

    #[test]
    fn test_corruption_is_format_error() {
        let bytes = populated(CodecConfig::default()).to_portable().to_bytes();

        let mut flipped = bytes.to_vec();
        flipped[20] ^= 0xff;
        let err = PortableIndex::from_bytes(&flipped).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FormatError);

        let err = PortableIndex::from_bytes(&bytes[..bytes.len() - 3]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FormatError);

        let err = PortableIndex::from_bytes(&[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FormatError);
    }

    #[test]
    fn test_bad_magic_with_valid_checksum() {
        let bytes = populated(CodecConfig::default()).to_portable().to_bytes();
        let mut body = bytes[..bytes.len() - CHECKSUM_LEN].to_vec();
        body[..4].copy_from_slice(b"XXXX");
        let checksum = xxh3_64(&body);
        body.extend_from_slice(&checksum.to_le_bytes());
        let err = PortableIndex::from_bytes(&body).unwrap_err();
        assert!(err.to_string().contains("bad magic"));
    }

    #[test]
    fn test_inconsistent_snapshot_rejected() {
        let mut snap = populated(CodecConfig::default()).to_portable();
        snap.lists[0].codes.push(0);
        let err = IvfSqIndex::from_portable(&snap, Resources::unbounded()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FormatError);

        let mut snap = populated(CodecConfig::default()).to_portable();
        snap.nprobe = 9;
        assert!(snap.validate().is_err());
    }

    #[test]
    fn test_copy_from_and_to() {
        let src = populated(CodecConfig::default());
        let mut dst = IvfSqIndex::new(
            7,
            1,
            DistanceMetric::InnerProduct,
            CodecConfig::default(),
            Resources::unbounded(),
        )
        .unwrap();
        dst.copy_from(&src.to_portable()).unwrap();
        assert_eq!(dst.dims(), 3);
        assert_eq!(dst.total_count(), src.total_count());

        let mut snap = IvfSqIndex::new(
            1,
            1,
            DistanceMetric::L2,
            CodecConfig::default(),
            Resources::unbounded(),
        )
        .unwrap()
        .to_portable();
        dst.copy_to(&mut snap);
        assert_eq!(snap, src.to_portable());
    }

    #[test]
    fn test_from_portable_charges_budget() {
        let snap = populated(CodecConfig::default()).to_portable();
        let err = IvfSqIndex::from_portable(&snap, Resources::with_memory_limit(16)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
    }
}
