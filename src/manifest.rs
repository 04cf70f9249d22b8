//! Handing build outputs to whatever packages them.
//!
//! The scheduler knows nothing about packaging. A [`ManifestEmitter`] gets the
//! outputs of the succeeded tasks plus a descriptor it defines itself, and
//! produces whatever it wants from them. [`JsonManifest`] is a simple emitter
//! writing a JSON listing.

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::Artifact;

/// Output of a succeeded task.
#[derive(Debug, Clone, Copy)]
pub struct Product<'a> {
    pub name: &'a str,
    pub artifact: &'a Artifact,
}

/// Turns build outputs into a package description. `D` is opaque to the
/// scheduler and passed through as given.
pub trait ManifestEmitter<D: ?Sized> {
    fn emit(&mut self, descriptor: &D, outputs: &[Product<'_>]) -> anyhow::Result<()>;
}

/// Descriptor understood by [`JsonManifest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDescriptor {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct ManifestFile<'a> {
    #[serde(flatten)]
    package: &'a PackageDescriptor,
    products: Vec<ProductEntry<'a>>,
}

#[derive(Serialize)]
struct ProductEntry<'a> {
    name: &'a str,
    hash: String,
    size: usize,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    attributes: &'a BTreeMap<String, String>,
}

/// Writes a pretty-printed JSON manifest listing every product with its
/// content hash.
#[derive(Debug, Clone)]
pub struct JsonManifest {
    path: Utf8PathBuf,
}

impl JsonManifest {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Renders the manifest without writing it.
    pub fn render(descriptor: &PackageDescriptor, outputs: &[Product<'_>]) -> anyhow::Result<String> {
        let file = ManifestFile {
            package: descriptor,
            products: outputs
                .iter()
                .map(|product| ProductEntry {
                    name: product.name,
                    hash: product.artifact.hash().to_hex(),
                    size: product.artifact.len(),
                    attributes: product.artifact.attributes(),
                })
                .collect(),
        };

        Ok(serde_json::to_string_pretty(&file)?)
    }
}

impl ManifestEmitter<PackageDescriptor> for JsonManifest {
    fn emit(&mut self, descriptor: &PackageDescriptor, outputs: &[Product<'_>]) -> anyhow::Result<()> {
        let text = Self::render(descriptor, outputs)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        fs::write(&self.path, text)?;
        tracing::info!("wrote manifest for {} products to {}", outputs.len(), self.path);

        Ok(())
    }
}
