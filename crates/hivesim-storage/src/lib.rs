//! File-backed collaborators for hivesim: JSON model loading, job and plan
//! documents, a JSON-lines output sink and a PNG image writer.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use hivesim_core::{
    ImageWriter, JobRecord, ListenedVariable, LoadError, ModelDescriptor, ModelLoader,
    OutputSink, Plan, Raster, Sample, SinkError, Value,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Number, json};
use thiserror::Error;
use tracing::{debug, warn};

/// Buffered step lines written before the sink flushes.
const DEFAULT_FLUSH_THRESHOLD: usize = 64;

/// Failure reading or writing a job document.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("i/o failure on `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed document `{}`: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Reads model descriptors from JSON files, relative paths resolved
/// against an optional root directory.
#[derive(Debug, Clone, Default)]
pub struct JsonModelLoader {
    root: Option<PathBuf>,
}

impl JsonModelLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl ModelLoader for JsonModelLoader {
    fn load(&self, path: &Path) -> Result<ModelDescriptor, LoadError> {
        let resolved = self.resolve(path);
        let text = fs::read_to_string(&resolved).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                LoadError::NotFound(resolved.clone())
            } else {
                LoadError::Io {
                    path: resolved.clone(),
                    source,
                }
            }
        })?;
        let descriptor = serde_json::from_str(&text).map_err(|err| LoadError::Parse {
            path: resolved.clone(),
            message: err.to_string(),
        })?;
        debug!(path = %resolved.display(), "model descriptor read");
        Ok(descriptor)
    }
}

fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T, PersistError> {
    let text = fs::read_to_string(path).map_err(|source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| PersistError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn write_document<T: Serialize>(path: &Path, document: &T) -> Result<(), PersistError> {
    let io = |source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io)?;
    }
    let text = serde_json::to_string_pretty(document).map_err(|source| PersistError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, text).map_err(io)
}

pub fn save_job(path: &Path, record: &JobRecord) -> Result<(), PersistError> {
    write_document(path, record)
}

pub fn load_job(path: &Path) -> Result<JobRecord, PersistError> {
    read_document(path)
}

pub fn save_plan(path: &Path, plan: &Plan) -> Result<(), PersistError> {
    write_document(path, plan)
}

pub fn load_plan(path: &Path) -> Result<Plan, PersistError> {
    read_document(path)
}

/// JSON rendition of a runtime value. Agents are written by handle and
/// rasters by their size.
#[must_use]
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Nil => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(f) => Number::from_f64(*f).map_or(serde_json::Value::Null, Into::into),
        Value::String(s) => json!(s),
        Value::Point(p) => json!({"x": p.x, "y": p.y}),
        Value::List(items) => items.iter().map(value_to_json).collect(),
        Value::Map(entries) => entries
            .iter()
            .map(|(key, item)| (key.clone(), value_to_json(item)))
            .collect::<Map<_, _>>()
            .into(),
        Value::Agent(_) => json!(value.to_string()),
        Value::Image(raster) => json!({"image": {"width": raster.width, "height": raster.height}}),
    }
}

/// JSON rendition of one output sample; unrefreshed outputs are written as
/// unavailable rather than omitted.
#[must_use]
pub fn sample_to_json(sample: &Sample) -> serde_json::Value {
    match sample {
        Sample::Unavailable => json!({"available": false}),
        Sample::Value(value) => json!({"available": true, "value": value_to_json(value)}),
        Sample::Image(image) => json!({
            "available": true,
            "image": {"name": image.name, "path": image.path.display().to_string()},
        }),
    }
}

/// Output sink writing one JSON document per line: the job header first,
/// then one line per step. Lines are buffered and flushed in batches.
pub struct JsonLinesSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    buffer: Vec<String>,
    flush_threshold: usize,
}

impl JsonLinesSink {
    /// Create or truncate the file at `path`.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        Self::with_threshold(path, DEFAULT_FLUSH_THRESHOLD)
    }

    pub fn with_threshold(path: impl Into<PathBuf>, flush_threshold: usize) -> Result<Self, SinkError> {
        let path = path.into();
        let io = |source| SinkError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io)?;
        }
        let file = File::create(&path).map_err(io)?;
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            buffer: Vec::new(),
            flush_threshold: flush_threshold.max(1),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn push(&mut self, line: serde_json::Value) -> Result<(), SinkError> {
        if self.writer.is_none() {
            return Err(SinkError::Closed);
        }
        self.buffer.push(line.to_string());
        if self.buffer.len() >= self.flush_threshold {
            self.flush()?;
        }
        Ok(())
    }

    /// Write buffered lines through to the file.
    pub fn flush(&mut self) -> Result<(), SinkError> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        let io = |source| SinkError::Io {
            path: self.path.clone(),
            source,
        };
        for line in self.buffer.drain(..) {
            writer.write_all(line.as_bytes()).map_err(io)?;
            writer.write_all(b"\n").map_err(io)?;
        }
        writer.flush().map_err(io)
    }
}

impl OutputSink for JsonLinesSink {
    fn write_header(&mut self, job: &JobRecord) -> Result<(), SinkError> {
        let header =
            serde_json::to_value(job).map_err(|err| SinkError::Encode(err.to_string()))?;
        self.push(json!({ "header": header }))
    }

    fn write_step(&mut self, step: u64, outputs: &[ListenedVariable]) -> Result<(), SinkError> {
        let samples: Map<String, serde_json::Value> = outputs
            .iter()
            .map(|output| (output.name.clone(), sample_to_json(&output.sample)))
            .collect();
        self.push(json!({ "step": step, "outputs": samples }))
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.flush()?;
        self.writer = None;
        debug!(path = %self.path.display(), "output sink closed");
        Ok(())
    }
}

impl Drop for JsonLinesSink {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(path = %self.path.display(), error = %err, "failed to flush output sink on drop");
        }
    }
}

/// Writes display rasters as PNG files, creating parent directories.
#[derive(Debug, Clone, Copy, Default)]
pub struct PngImageWriter;

impl ImageWriter for PngImageWriter {
    fn write_image(&mut self, path: &Path, raster: &Raster) -> Result<(), SinkError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| SinkError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let buffer = image::RgbaImage::from_raw(raster.width, raster.height, raster.to_rgba_bytes())
            .ok_or_else(|| SinkError::Encode("raster size does not match its pixels".into()))?;
        buffer
            .save_with_format(path, image::ImageFormat::Png)
            .map_err(|err| SinkError::Encode(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hivesim_core::{ImageRef, OutputKind};

    #[test]
    fn values_render_as_plain_json() {
        let value = Value::List(vec![
            Value::Int(3),
            Value::Float(0.5),
            Value::Point(hivesim_core::Point::new(1.0, 2.0)),
            Value::Nil,
        ]);
        assert_eq!(
            value_to_json(&value),
            json!([3, 0.5, {"x": 1.0, "y": 2.0}, null])
        );
        assert_eq!(value_to_json(&Value::Float(f64::NAN)), serde_json::Value::Null);
    }

    #[test]
    fn samples_distinguish_unavailable_from_empty() {
        assert_eq!(sample_to_json(&Sample::Unavailable), json!({"available": false}));
        assert_eq!(
            sample_to_json(&Sample::Value(Value::List(Vec::new()))),
            json!({"available": true, "value": []})
        );
        let image = Sample::Image(ImageRef {
            name: "map".into(),
            path: PathBuf::from("images/map0-4.png"),
        });
        assert_eq!(sample_to_json(&image)["image"]["path"], "images/map0-4.png");
        let listened = ListenedVariable {
            name: "map".into(),
            kind: OutputKind::Output,
            sample: image,
        };
        assert!(listened.sample.is_available());
    }
}
