//! Minimal GGUF v3 reader/writer for adapter checkpoints.
//!
//! Only the subset needed for float32 tensor archives is implemented:
//! string/u32/u64/f32 metadata values and F32 tensor data with the standard
//! 32-byte alignment. Dimensions are stored innermost-first per the GGML
//! convention.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Cursor, Read, Seek, Write};
use std::path::Path;
use std::rc::Rc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use mlx_rs::{Array, Dtype};
use mlxtune_core::{MlxTuneError, Result};

/// `GGUF` in little-endian byte order.
pub const GGUF_MAGIC: u32 = 0x4655_4747;
/// Format version written and accepted.
pub const GGUF_VERSION: u32 = 3;

const ALIGNMENT: u64 = 32;

const GGML_TYPE_F32: u32 = 0;

const VALUE_TYPE_UINT32: u32 = 4;
const VALUE_TYPE_FLOAT32: u32 = 6;
const VALUE_TYPE_BOOL: u32 = 7;
const VALUE_TYPE_STRING: u32 = 8;
const VALUE_TYPE_UINT64: u32 = 10;

fn align_to(offset: u64, alignment: u64) -> u64 {
    offset.div_ceil(alignment) * alignment
}

fn write_string<W: Write>(writer: &mut W, s: &str) -> Result<()> {
    writer.write_u64::<LittleEndian>(s.len() as u64)?;
    writer.write_all(s.as_bytes())?;
    Ok(())
}

fn read_string<R: Read>(reader: &mut R) -> Result<String> {
    let len = reader.read_u64::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|e| MlxTuneError::Config(format!("invalid UTF-8 in GGUF string: {e}")))
}

/// Write float32 tensors with string metadata as a GGUF archive.
pub fn save_tensors<P: AsRef<Path>>(
    path: P,
    tensors: &HashMap<Rc<str>, Array>,
    metadata: &[(String, String)],
) -> Result<()> {
    // Deterministic tensor order keeps archives reproducible.
    let mut names: Vec<&Rc<str>> = tensors.keys().collect();
    names.sort();

    let mut writer = BufWriter::new(File::create(path.as_ref())?);

    writer.write_u32::<LittleEndian>(GGUF_MAGIC)?;
    writer.write_u32::<LittleEndian>(GGUF_VERSION)?;
    writer.write_u64::<LittleEndian>(names.len() as u64)?;
    writer.write_u64::<LittleEndian>(metadata.len() as u64)?;

    for (key, value) in metadata {
        write_string(&mut writer, key)?;
        writer.write_u32::<LittleEndian>(VALUE_TYPE_STRING)?;
        write_string(&mut writer, value)?;
    }

    // Tensor infos, with offsets relative to the aligned data section.
    let mut offset = 0u64;
    let mut payloads: Vec<Vec<f32>> = Vec::with_capacity(names.len());
    for name in &names {
        let array = &tensors[*name];
        let array = array.as_dtype(Dtype::Float32)?;
        array.eval()?;
        let data: Vec<f32> = array.as_slice().to_vec();

        write_string(&mut writer, name)?;

        let shape = array.shape();
        writer.write_u32::<LittleEndian>(shape.len() as u32)?;
        // Innermost dimension first.
        for dim in shape.iter().rev() {
            writer.write_u64::<LittleEndian>(*dim as u64)?;
        }
        writer.write_u32::<LittleEndian>(GGML_TYPE_F32)?;
        writer.write_u64::<LittleEndian>(offset)?;

        offset = align_to(offset + (data.len() * 4) as u64, ALIGNMENT);
        payloads.push(data);
    }

    // Pad to the data section, then the payloads with inter-tensor padding.
    let here = writer.stream_position()?;
    for _ in here..align_to(here, ALIGNMENT) {
        writer.write_u8(0)?;
    }

    for (i, data) in payloads.iter().enumerate() {
        for value in data {
            writer.write_f32::<LittleEndian>(*value)?;
        }
        if i + 1 < payloads.len() {
            let here = writer.stream_position()?;
            for _ in here..align_to(here, ALIGNMENT) {
                writer.write_u8(0)?;
            }
        }
    }

    writer.flush()?;
    Ok(())
}

struct TensorInfo {
    name: String,
    shape: Vec<i32>,
    offset: u64,
}

/// Read every float32 tensor from a GGUF archive.
pub fn load_tensors<P: AsRef<Path>>(path: P) -> Result<HashMap<String, Array>> {
    let bytes = std::fs::read(path.as_ref())?;
    let mut cursor = Cursor::new(&bytes);

    let magic = cursor.read_u32::<LittleEndian>()?;
    if magic != GGUF_MAGIC {
        return Err(MlxTuneError::Config(format!(
            "not a GGUF file (magic {magic:#x})"
        )));
    }
    let version = cursor.read_u32::<LittleEndian>()?;
    if version != GGUF_VERSION {
        return Err(MlxTuneError::Config(format!(
            "unsupported GGUF version {version}"
        )));
    }

    let tensor_count = cursor.read_u64::<LittleEndian>()?;
    let metadata_count = cursor.read_u64::<LittleEndian>()?;

    for _ in 0..metadata_count {
        let _key = read_string(&mut cursor)?;
        let value_type = cursor.read_u32::<LittleEndian>()?;
        match value_type {
            VALUE_TYPE_STRING => {
                read_string(&mut cursor)?;
            }
            VALUE_TYPE_UINT32 | VALUE_TYPE_FLOAT32 => {
                cursor.read_u32::<LittleEndian>()?;
            }
            VALUE_TYPE_BOOL => {
                cursor.read_u8()?;
            }
            VALUE_TYPE_UINT64 => {
                cursor.read_u64::<LittleEndian>()?;
            }
            other => {
                return Err(MlxTuneError::Config(format!(
                    "unsupported GGUF metadata value type {other}"
                )));
            }
        }
    }

    let mut infos = Vec::with_capacity(tensor_count as usize);
    for _ in 0..tensor_count {
        let name = read_string(&mut cursor)?;
        let n_dims = cursor.read_u32::<LittleEndian>()?;
        let mut shape = Vec::with_capacity(n_dims as usize);
        for _ in 0..n_dims {
            shape.push(cursor.read_u64::<LittleEndian>()? as i32);
        }
        // Back to row-major order.
        shape.reverse();

        let dtype = cursor.read_u32::<LittleEndian>()?;
        if dtype != GGML_TYPE_F32 {
            return Err(MlxTuneError::Config(format!(
                "unsupported GGUF tensor type {dtype} for {name}"
            )));
        }
        let offset = cursor.read_u64::<LittleEndian>()?;

        infos.push(TensorInfo {
            name,
            shape,
            offset,
        });
    }

    let data_start = align_to(cursor.position(), ALIGNMENT);

    let mut tensors = HashMap::with_capacity(infos.len());
    for info in infos {
        let numel: usize = info.shape.iter().map(|&d| d as usize).product();
        let start = (data_start + info.offset) as usize;
        let end = start + numel * 4;
        if end > bytes.len() {
            return Err(MlxTuneError::Config(format!(
                "GGUF tensor {} overruns the file",
                info.name
            )));
        }

        let mut data = Vec::with_capacity(numel);
        let mut chunk = Cursor::new(&bytes[start..end]);
        for _ in 0..numel {
            data.push(chunk.read_f32::<LittleEndian>()?);
        }

        tensors.insert(info.name, Array::from_slice(&data, &info.shape));
    }

    Ok(tensors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adapters.gguf");

        let mut tensors: HashMap<Rc<str>, Array> = HashMap::new();
        let a = mlx_rs::random::normal::<f32>(&[4, 3], None, None, None).unwrap();
        let b = mlx_rs::ops::zeros::<f32>(&[5]).unwrap();
        a.eval().unwrap();
        tensors.insert(Rc::from("layers.0.lora_a"), a.clone());
        tensors.insert(Rc::from("layers.0.lora_b"), b);

        save_tensors(&path, &tensors, &[("general.architecture".into(), "llama".into())])
            .unwrap();

        let loaded = load_tensors(&path).unwrap();
        assert_eq!(loaded.len(), 2);

        let restored = &loaded["layers.0.lora_a"];
        assert_eq!(restored.shape(), &[4, 3]);

        let diff = restored.subtract(&a).unwrap().abs().unwrap().max(None).unwrap();
        diff.eval().unwrap();
        assert_eq!(diff.item::<f32>(), 0.0);

        assert_eq!(loaded["layers.0.lora_b"].shape(), &[5]);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.gguf");
        std::fs::write(&path, b"not a gguf file at all").unwrap();

        assert!(load_tensors(&path).is_err());
    }
}
