//! Decode manifest files into dynamic Kubernetes objects and partition them
//! into the two apply phases.
//!
//! Manifest decoding itself is treated as an opaque lazy-sequence parser:
//! we lean on `serde_yaml`'s multi-document support and convert each
//! document straight into `kube::core::DynamicObject`, never inspecting the
//! YAML structure beyond what's needed to resolve a REST mapping.

use kube::core::DynamicObject;
use snafu::{ResultExt, Snafu};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
pub enum ManifestError {
    #[snafu(display("failed to parse YAML document #{index} in {path:?}: {source}"))]
    ParseYaml {
        path: PathBuf,
        index: usize,
        source: serde_yaml::Error,
    },

    #[snafu(display("document #{index} in {path:?} is not a valid Kubernetes object: {source}"))]
    NotAnObject {
        path: PathBuf,
        index: usize,
        source: serde_json::Error,
    },
}

/// Group/kind that identifies a custom resource type definition. Documents
/// of this type are applied in phase 1, in parallel, because they share a
/// pre-built REST mapping and only ever create reads against it.
const CRD_GROUP: &str = "apiextensions.k8s.io";
const CRD_KIND: &str = "CustomResourceDefinition";

pub struct ManifestDocument {
    pub source_path: PathBuf,
    pub index: usize,
    pub object: DynamicObject,
}

impl ManifestDocument {
    pub fn is_custom_resource_definition(&self) -> bool {
        let gvk = self.object.types.as_ref();
        match gvk {
            Some(types) => {
                types.kind == CRD_KIND
                    && types
                        .api_version
                        .split('/')
                        .next()
                        .map(|group| group == CRD_GROUP)
                        .unwrap_or(false)
            }
            None => false,
        }
    }
}

/// Parse every YAML document out of `files` (path -> contents, as produced
/// by [`crate::hash::hash_directory`]) into [`ManifestDocument`]s, skipping
/// empty documents (a trailing `---` or a comment-only file).
pub fn parse_documents(
    files: &BTreeMap<PathBuf, String>,
) -> Result<Vec<ManifestDocument>, ManifestError> {
    let mut documents = Vec::new();
    for (path, contents) in files {
        for (index, document) in serde_yaml::Deserializer::from_str(contents).enumerate() {
            let value = serde_yaml::Value::deserialize(document).context(ParseYamlSnafu {
                path: path.clone(),
                index,
            })?;
            if matches!(value, serde_yaml::Value::Null) {
                continue;
            }
            let json = serde_json::to_value(value).expect("yaml Value always converts to json");
            let object: DynamicObject =
                serde_json::from_value(json).context(NotAnObjectSnafu {
                    path: path.clone(),
                    index,
                })?;
            documents.push(ManifestDocument {
                source_path: path.clone(),
                index,
                object,
            });
        }
    }
    Ok(documents)
}

/// Split documents into (phase 1: custom resource definitions, phase 2:
/// everything else), preserving file order within each phase.
pub fn partition(
    documents: Vec<ManifestDocument>,
) -> (Vec<ManifestDocument>, Vec<ManifestDocument>) {
    documents
        .into_iter()
        .partition(|doc| doc.is_custom_resource_definition())
}

use serde::Deserialize;

#[cfg(test)]
mod tests {
    use super::*;

    fn files_with(contents: &str) -> BTreeMap<PathBuf, String> {
        let mut map = BTreeMap::new();
        map.insert(PathBuf::from("a.yaml"), contents.to_string());
        map
    }

    #[test]
    fn parses_a_single_document() {
        let files = files_with("apiVersion: v1\nkind: Namespace\nmetadata:\n  name: ns-a\n");
        let docs = parse_documents(&files).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].object.types.as_ref().unwrap().kind, "Namespace");
    }

    #[test]
    fn parses_multiple_documents_separated_by_dashes() {
        let files = files_with(
            "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: ns-a\n---\napiVersion: v1\nkind: Namespace\nmetadata:\n  name: ns-b\n",
        );
        let docs = parse_documents(&files).unwrap();
        assert_eq!(docs.len(), 2);
    }

    #[test]
    fn skips_empty_trailing_documents() {
        let files = files_with("apiVersion: v1\nkind: Namespace\nmetadata:\n  name: ns-a\n---\n");
        let docs = parse_documents(&files).unwrap();
        assert_eq!(docs.len(), 1);
    }

    #[test]
    fn partitions_crds_from_other_objects() {
        let files = files_with(
            "apiVersion: apiextensions.k8s.io/v1\nkind: CustomResourceDefinition\nmetadata:\n  name: widgets.example.com\n---\napiVersion: v1\nkind: Namespace\nmetadata:\n  name: ns-a\n",
        );
        let docs = parse_documents(&files).unwrap();
        let (crds, rest) = partition(docs);
        assert_eq!(crds.len(), 1);
        assert_eq!(rest.len(), 1);
    }
}
