//! Model catalog
//!
//! Resolves model names to built-in demo models or GGUF files found under the
//! models directory, and loads them through the matching backend.

use std::path::{Path, PathBuf};

use crate::inference::backend::{LoadedModel, ModelLoader, Precision};
use crate::inference::demo::{DemoModel, BUILTIN_MODELS};
use crate::inference::error::ModelLoadError;
use crate::inference::model::read_gguf_header;
use crate::system::Device;

/// Where a model's tokenizer and weights come from
#[derive(Debug, Clone, PartialEq)]
pub enum ModelSource {
    BuiltIn(&'static str),
    Gguf(PathBuf),
}

/// A model the catalog can resolve
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub name: String,
    pub source: ModelSource,
    pub size_bytes: Option<u64>,
}

impl CatalogEntry {
    /// Human-readable size, empty for built-in models
    pub fn size_string(&self) -> String {
        let Some(bytes) = self.size_bytes else {
            return String::new();
        };
        let bytes = bytes as f64;

        if bytes < 1024.0 {
            format!("{} B", bytes)
        } else if bytes < 1024.0 * 1024.0 {
            format!("{:.2} KB", bytes / 1024.0)
        } else if bytes < 1024.0 * 1024.0 * 1024.0 {
            format!("{:.2} MB", bytes / (1024.0 * 1024.0))
        } else {
            format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
        }
    }
}

/// Built-in models plus the `.gguf` files under an optional models directory
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models_dir: Option<PathBuf>,
}

impl ModelCatalog {
    pub fn new(models_dir: Option<PathBuf>) -> Self {
        Self { models_dir }
    }

    /// Every resolvable model, built-ins first
    pub fn entries(&self) -> Vec<CatalogEntry> {
        let mut entries: Vec<CatalogEntry> = BUILTIN_MODELS
            .iter()
            .map(|&(name, _)| CatalogEntry {
                name: name.to_string(),
                source: ModelSource::BuiltIn(name),
                size_bytes: None,
            })
            .collect();

        if let Some(dir) = &self.models_dir {
            for entry in scan_gguf_directory(dir) {
                if entries.iter().any(|e| e.name == entry.name) {
                    tracing::warn!("Skipping duplicate model name {}", entry.name);
                    continue;
                }
                entries.push(entry);
            }
        }
        entries
    }

    /// Resolves a catalog name, or a direct path to an existing `.gguf` file
    pub fn resolve(&self, name: &str) -> Result<ModelSource, ModelLoadError> {
        if let Some((builtin, _)) = BUILTIN_MODELS.iter().find(|(n, _)| *n == name) {
            return Ok(ModelSource::BuiltIn(*builtin));
        }

        let as_path = Path::new(name);
        if has_gguf_extension(as_path) && as_path.is_file() {
            return Ok(ModelSource::Gguf(as_path.to_path_buf()));
        }

        self.entries()
            .into_iter()
            .find(|e| e.name == name)
            .map(|e| e.source)
            .ok_or_else(|| ModelLoadError::UnknownModel(name.to_string()))
    }
}

fn has_gguf_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("gguf"))
        .unwrap_or(false)
}

/// Recursively finds `.gguf` files; each is named by its file stem
///
/// A missing directory yields no entries.
pub fn scan_gguf_directory(directory: &Path) -> Vec<CatalogEntry> {
    if !directory.is_dir() {
        tracing::debug!("Models directory does not exist: {}", directory.display());
        return Vec::new();
    }

    let pattern = format!(
        "{}/**/*.gguf",
        glob::Pattern::escape(&directory.to_string_lossy())
    );
    let paths = match glob::glob(&pattern) {
        Ok(paths) => paths,
        Err(e) => {
            tracing::warn!("Bad models directory pattern {}: {}", pattern, e);
            return Vec::new();
        }
    };

    let mut entries: Vec<CatalogEntry> = paths
        .filter_map(|entry| match entry {
            Ok(path) if path.is_file() => Some(path),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("Failed to read model path: {}", e);
                None
            }
        })
        .filter_map(|path| {
            let name = path.file_stem()?.to_string_lossy().to_string();
            let size_bytes = std::fs::metadata(&path).ok().map(|m| m.len());
            Some(CatalogEntry {
                name,
                source: ModelSource::Gguf(path),
                size_bytes,
            })
        })
        .collect();

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    tracing::info!("Found {} GGUF model(s) in {}", entries.len(), directory.display());
    entries
}

/// Loader dispatching catalog entries to the demo or llama.cpp backend
pub struct CatalogLoader {
    catalog: ModelCatalog,
    gpu_layers: u32,
}

impl CatalogLoader {
    pub fn new(catalog: ModelCatalog, gpu_layers: u32) -> Self {
        Self {
            catalog,
            gpu_layers,
        }
    }
}

impl ModelLoader for CatalogLoader {
    fn load(
        &self,
        name: &str,
        device: Device,
        precision: Precision,
    ) -> Result<Box<dyn LoadedModel>, ModelLoadError> {
        match self.catalog.resolve(name)? {
            ModelSource::BuiltIn(builtin) => {
                Ok(Box::new(DemoModel::load(builtin, device, precision)?))
            }
            ModelSource::Gguf(path) => {
                let header = read_gguf_header(&path)?;
                tracing::debug!(
                    "GGUF v{} header ok for {} ({} tensors)",
                    header.version,
                    path.display(),
                    header.tensor_count
                );
                load_gguf(&path, device, precision, self.gpu_layers)
            }
        }
    }

    fn available_models(&self) -> Vec<String> {
        self.catalog.entries().into_iter().map(|e| e.name).collect()
    }
}

#[cfg(feature = "llama")]
fn load_gguf(
    path: &Path,
    device: Device,
    precision: Precision,
    gpu_layers: u32,
) -> Result<Box<dyn LoadedModel>, ModelLoadError> {
    let model = crate::inference::llama::LlamaCppModel::load(path, device, precision, gpu_layers)?;
    Ok(Box::new(model))
}

#[cfg(not(feature = "llama"))]
fn load_gguf(
    path: &Path,
    _device: Device,
    _precision: Precision,
    _gpu_layers: u32,
) -> Result<Box<dyn LoadedModel>, ModelLoadError> {
    Err(ModelLoadError::BackendUnavailable(format!(
        "{} is a GGUF model but this build lacks the `llama` feature",
        path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    #[test]
    fn test_builtins_always_listed() {
        let catalog = ModelCatalog::new(None);
        let names: Vec<String> = catalog.entries().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["demo-model", "demo-model-verse"]);
    }

    #[test]
    fn test_scan_finds_nested_gguf() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("llama")).unwrap();
        File::create(dir.path().join("qwen-0.5b.gguf")).unwrap();
        File::create(dir.path().join("llama").join("tiny-llama.gguf")).unwrap();
        File::create(dir.path().join("notes.txt")).unwrap();

        let entries = scan_gguf_directory(dir.path());
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["qwen-0.5b", "tiny-llama"]);
        assert_eq!(entries[0].size_bytes, Some(0));
    }

    #[test]
    fn test_scan_missing_directory() {
        assert!(scan_gguf_directory(Path::new("/this/path/does/not/exist")).is_empty());
    }

    #[test]
    fn test_resolve() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("phi.gguf");
        File::create(&path).unwrap();
        let catalog = ModelCatalog::new(Some(dir.path().to_path_buf()));

        assert_eq!(
            catalog.resolve("demo-model").unwrap(),
            ModelSource::BuiltIn("demo-model")
        );
        assert_eq!(catalog.resolve("phi").unwrap(), ModelSource::Gguf(path.clone()));
        assert_eq!(
            catalog.resolve(&path.to_string_lossy()).unwrap(),
            ModelSource::Gguf(path)
        );
        assert_eq!(
            catalog.resolve("gpt2"),
            Err(ModelLoadError::UnknownModel("gpt2".to_string()))
        );
    }

    #[test]
    fn test_loader_rejects_corrupt_gguf() {
        let dir = TempDir::new().unwrap();
        File::create(dir.path().join("broken.gguf")).unwrap();
        let loader = CatalogLoader::new(ModelCatalog::new(Some(dir.path().to_path_buf())), 0);

        let err = loader.load("broken", Device::Cpu, Precision::Full).err();
        assert!(matches!(err, Some(ModelLoadError::InvalidModelFile(_))));
    }

    #[cfg(not(feature = "llama"))]
    #[test]
    fn test_valid_gguf_without_llama_feature() {
        let dir = TempDir::new().unwrap();
        crate::inference::model::write_test_gguf(&dir.path().join("tiny.gguf"), 3, 4);
        let loader = CatalogLoader::new(ModelCatalog::new(Some(dir.path().to_path_buf())), 0);

        let err = loader.load("tiny", Device::Cpu, Precision::Full).err();
        assert!(matches!(err, Some(ModelLoadError::BackendUnavailable(_))));
    }

    #[test]
    fn test_loader_loads_builtin() {
        let loader = CatalogLoader::new(ModelCatalog::default(), 0);
        let model = loader.load("demo-model", Device::Cpu, Precision::Full).unwrap();
        assert_eq!(model.facts().vocab_size, 258);
        assert!(loader.available_models().contains(&"demo-model".to_string()));
    }

    #[test]
    fn test_size_string() {
        let entry = CatalogEntry {
            name: "big".to_string(),
            source: ModelSource::Gguf(PathBuf::from("big.gguf")),
            size_bytes: Some(1024 * 1024 * 1024 * 3),
        };
        assert_eq!(entry.size_string(), "3.00 GB");
    }
}
