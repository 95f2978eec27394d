//! Adapter-only checkpoint artifact.
//!
//! Layout: a small header (magic, version, element-type tag, adapter count,
//! per-adapter name and matrix shapes) followed by, for each adapter in
//! ascending name order, the raw bytes of A then B, row-major in native
//! endianness. Loading rejects any mismatch between the declared shapes and
//! the current adapter set.

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use nanotune_core::error::checkpoint_error;
use nanotune_core::{NanoTuneError, Result};

use crate::lora::LoraSet;

const MAGIC: &[u8; 4] = b"NTAD";
const VERSION: u32 = 1;
const ELEM_TAG_F32: u8 = 0;

fn write_u32<W: Write>(w: &mut W, v: u32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn write_shape<W: Write>(w: &mut W, shape: &[usize]) -> Result<()> {
    write_u32(w, shape.len() as u32)?;
    for &d in shape {
        write_u32(w, d as u32)?;
    }
    Ok(())
}

fn read_shape<R: Read>(r: &mut R) -> Result<Vec<usize>> {
    let rank = read_u32(r)? as usize;
    if rank > 8 {
        return Err(NanoTuneError::Checkpoint {
            message: format!("implausible shape rank {}", rank),
            path: String::new(),
        });
    }
    (0..rank).map(|_| Ok(read_u32(r)? as usize)).collect()
}

/// Serialize all adapters of the set, ordered by name ascending.
pub fn save_adapters<W: Write>(w: &mut W, adapters: &LoraSet) -> Result<()> {
    w.write_all(MAGIC)?;
    write_u32(w, VERSION)?;
    w.write_all(&[ELEM_TAG_F32])?;
    write_u32(w, adapters.len() as u32)?;

    for (name, adapter) in adapters.iter() {
        write_u32(w, name.len() as u32)?;
        w.write_all(name.as_bytes())?;
        write_shape(w, adapter.a.shape())?;
        write_shape(w, adapter.b.shape())?;
    }

    for (_, adapter) in adapters.iter() {
        for t in [&adapter.a, &adapter.b] {
            for &x in t.data_f32()? {
                w.write_all(&x.to_ne_bytes())?;
            }
        }
    }
    Ok(())
}

/// Deserialize into an existing adapter set. The header must declare
/// exactly the current adapters (same names, same shapes); any mismatch is
/// rejected before any matrix is touched.
pub fn load_adapters<R: Read>(r: &mut R, adapters: &mut LoraSet) -> Result<()> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(NanoTuneError::Checkpoint {
            message: format!("bad magic {:02x?}", magic),
            path: String::new(),
        });
    }
    let version = read_u32(r)?;
    if version != VERSION {
        return Err(NanoTuneError::Checkpoint {
            message: format!("unsupported version {}", version),
            path: String::new(),
        });
    }
    let mut tag = [0u8; 1];
    r.read_exact(&mut tag)?;
    if tag[0] != ELEM_TAG_F32 {
        return Err(NanoTuneError::Checkpoint {
            message: format!("unsupported element type tag {}", tag[0]),
            path: String::new(),
        });
    }
    let count = read_u32(r)? as usize;
    if count != adapters.len() {
        return Err(NanoTuneError::Checkpoint {
            message: format!(
                "checkpoint has {} adapters, current set has {}",
                count,
                adapters.len()
            ),
            path: String::new(),
        });
    }

    let mut declared: Vec<(String, Vec<usize>, Vec<usize>)> = Vec::with_capacity(count);
    for _ in 0..count {
        let name_len = read_u32(r)? as usize;
        let mut name_bytes = vec![0u8; name_len];
        r.read_exact(&mut name_bytes)?;
        let name = String::from_utf8(name_bytes).map_err(|e| NanoTuneError::Checkpoint {
            message: format!("invalid adapter name: {}", e),
            path: String::new(),
        })?;
        let a_shape = read_shape(r)?;
        let b_shape = read_shape(r)?;
        declared.push((name, a_shape, b_shape));
    }

    for (name, a_shape, b_shape) in &declared {
        let adapter = adapters.get(name).ok_or_else(|| NanoTuneError::Checkpoint {
            message: format!("checkpoint adapter '{}' not in current set", name),
            path: String::new(),
        })?;
        if adapter.a.shape() != a_shape.as_slice() || adapter.b.shape() != b_shape.as_slice() {
            return Err(NanoTuneError::shape(
                &format!("checkpoint adapter {}", name),
                adapter.a.shape(),
                a_shape,
            ));
        }
    }

    for (name, a_shape, b_shape) in &declared {
        let adapter = adapters.get_mut(name).expect("verified above");
        for (t, shape) in [(&mut adapter.a, a_shape), (&mut adapter.b, b_shape)] {
            let count: usize = shape.iter().product();
            let mut bytes = vec![0u8; count * 4];
            r.read_exact(&mut bytes)?;
            let dst = t.data_f32_mut()?;
            for (i, chunk) in bytes.chunks_exact(4).enumerate() {
                dst[i] = f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
        }
    }
    Ok(())
}

/// Metadata stored alongside the adapter artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub step: usize,
    pub loss: f64,
    pub num_adapters: usize,
    pub trainable_params: usize,
}

/// Consumer of periodic adapter snapshots.
pub trait CheckpointSink: Send {
    fn write(&mut self, epoch: usize, step: usize, loss: f64, adapters: &LoraSet) -> Result<()>;
}

/// Sink writing `step_NNNNNN/adapters.bin` plus `meta.json` under a
/// directory.
pub struct DirectoryCheckpointSink {
    dir: PathBuf,
}

impl DirectoryCheckpointSink {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn step_dir(&self, step: usize) -> PathBuf {
        self.dir.join(format!("step_{:06}", step))
    }
}

impl CheckpointSink for DirectoryCheckpointSink {
    fn write(&mut self, epoch: usize, step: usize, loss: f64, adapters: &LoraSet) -> Result<()> {
        let dir = self.step_dir(step);
        std::fs::create_dir_all(&dir).map_err(|e| checkpoint_error(e.to_string(), &dir))?;

        let bin_path = dir.join("adapters.bin");
        let mut file = std::io::BufWriter::new(
            std::fs::File::create(&bin_path)
                .map_err(|e| checkpoint_error(e.to_string(), &bin_path))?,
        );
        save_adapters(&mut file, adapters)?;
        file.flush()?;

        let meta = CheckpointMeta {
            epoch,
            step,
            loss,
            num_adapters: adapters.len(),
            trainable_params: adapters.total_params(),
        };
        let meta_path = dir.join("meta.json");
        std::fs::write(&meta_path, serde_json::to_string_pretty(&meta)?)
            .map_err(|e| checkpoint_error(e.to_string(), &meta_path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::LoraAdapter;
    use nanotune_core::LoraConfig;
    use nanotune_tensor::{MemoryAccountant, MemoryCategory, Tensor};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn test_set(seed: u64) -> LoraSet {
        let acc = Arc::new(MemoryAccountant::new());
        let config = LoraConfig {
            rank: 2,
            alpha: 4.0,
            dropout: 0.0,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(seed);
        let mut set = LoraSet::new();
        set.attach(LoraAdapter::new("layer0.out-proj", 4, 3, &config, &mut rng, &acc).unwrap())
            .unwrap();
        set.attach(LoraAdapter::new("layer3.router", 3, 2, &config, &mut rng, &acc).unwrap())
            .unwrap();
        set
    }

    fn randomize(set: &mut LoraSet, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        for (_, adapter) in set.iter_mut() {
            let acc = Arc::clone(adapter.a.accountant());
            let ra = Tensor::randn(adapter.a.shape(), 1.0, &mut rng, MemoryCategory::Temporary, &acc)
                .unwrap();
            adapter
                .a
                .data_f32_mut()
                .unwrap()
                .copy_from_slice(ra.data_f32().unwrap());
            let rb = Tensor::randn(adapter.b.shape(), 1.0, &mut rng, MemoryCategory::Temporary, &acc)
                .unwrap();
            adapter
                .b
                .data_f32_mut()
                .unwrap()
                .copy_from_slice(rb.data_f32().unwrap());
        }
    }

    #[test]
    fn test_roundtrip_restores_every_element() {
        let mut set = test_set(1);
        randomize(&mut set, 2);
        let originals: Vec<Vec<f32>> = set
            .iter()
            .flat_map(|(_, ad)| {
                [
                    ad.a.data_f32().unwrap().to_vec(),
                    ad.b.data_f32().unwrap().to_vec(),
                ]
            })
            .collect();

        let mut buf = Vec::new();
        save_adapters(&mut buf, &set).unwrap();

        // Reset to new random values, then restore.
        randomize(&mut set, 99);
        load_adapters(&mut buf.as_slice(), &mut set).unwrap();

        let restored: Vec<Vec<f32>> = set
            .iter()
            .flat_map(|(_, ad)| {
                [
                    ad.a.data_f32().unwrap().to_vec(),
                    ad.b.data_f32().unwrap().to_vec(),
                ]
            })
            .collect();
        assert_eq!(originals, restored);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut set = test_set(1);
        let mut buf = Vec::new();
        save_adapters(&mut buf, &set).unwrap();
        buf[0] = b'X';
        assert!(matches!(
            load_adapters(&mut buf.as_slice(), &mut set),
            Err(NanoTuneError::Checkpoint { .. })
        ));
    }

    #[test]
    fn test_shape_mismatch_rejected_before_any_write() {
        let set_a = test_set(1);
        let mut buf = Vec::new();
        save_adapters(&mut buf, &set_a).unwrap();

        // A set with the same names but a different rank.
        let acc = Arc::new(MemoryAccountant::new());
        let config = LoraConfig {
            rank: 4,
            alpha: 8.0,
            dropout: 0.0,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(5);
        let mut other = LoraSet::new();
        other
            .attach(LoraAdapter::new("layer0.out-proj", 4, 3, &config, &mut rng, &acc).unwrap())
            .unwrap();
        other
            .attach(LoraAdapter::new("layer3.router", 3, 2, &config, &mut rng, &acc).unwrap())
            .unwrap();

        let before: Vec<f32> = other
            .get("layer0.out-proj")
            .unwrap()
            .a
            .data_f32()
            .unwrap()
            .to_vec();
        assert!(load_adapters(&mut buf.as_slice(), &mut other).is_err());
        assert_eq!(
            other
                .get("layer0.out-proj")
                .unwrap()
                .a
                .data_f32()
                .unwrap(),
            before.as_slice()
        );
    }

    #[test]
    fn test_adapter_count_mismatch_rejected() {
        let set_two = test_set(1);
        let mut buf = Vec::new();
        save_adapters(&mut buf, &set_two).unwrap();

        let acc = Arc::new(MemoryAccountant::new());
        let config = LoraConfig {
            rank: 2,
            alpha: 4.0,
            dropout: 0.0,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(5);
        let mut one = LoraSet::new();
        one.attach(LoraAdapter::new("layer0.out-proj", 4, 3, &config, &mut rng, &acc).unwrap())
            .unwrap();
        assert!(load_adapters(&mut buf.as_slice(), &mut one).is_err());
    }

    #[test]
    fn test_directory_sink_writes_artifacts() {
        let set = test_set(1);
        let tmp = tempfile::tempdir().unwrap();
        let mut sink = DirectoryCheckpointSink::new(tmp.path());
        sink.write(0, 42, 3.25, &set).unwrap();

        let dir = sink.step_dir(42);
        assert!(dir.join("adapters.bin").exists());
        let meta: CheckpointMeta =
            serde_json::from_str(&std::fs::read_to_string(dir.join("meta.json")).unwrap())
                .unwrap();
        assert_eq!(meta.step, 42);
        assert_eq!(meta.num_adapters, 2);
        assert!((meta.loss - 3.25).abs() < 1e-12);
    }
}
