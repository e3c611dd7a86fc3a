use super::support::{pack, signed_with, Fixture, PackHandler};
use async_trait::async_trait;
use futures::StreamExt;
use nestsign::container::EntryStream;
use nestsign::{
    CancellationToken, ContainerEntry, ContainerHandler, ContainerMetadata, ContentAnalyzer,
    ContentKey, ExtensionPolicy, HandlerRegistry, NodeState, RecursiveSigner, RecursiveSigning,
    RepackEntry, SigningConfiguration, SigningError, SigningRequest, Stage,
};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

/// Claims `.pack` files too, under another name.
struct ShadowPack;

#[async_trait]
impl ContainerHandler for ShadowPack {
    fn name(&self) -> &str {
        "shadow-pack"
    }

    fn can_handle(&self, path: &Path) -> bool {
        path.extension().is_some_and(|e| e == "pack")
    }

    async fn read_entries(&self, _path: &Path) -> anyhow::Result<(ContainerMetadata, EntryStream)> {
        anyhow::bail!("shadow handler cannot read")
    }

    async fn write_container(
        &self,
        _destination: &Path,
        _source: &Path,
        _entries: &[RepackEntry],
        _metadata: &ContainerMetadata,
    ) -> anyhow::Result<()> {
        anyhow::bail!("shadow handler cannot write")
    }
}

#[tokio::test]
async fn test_two_handlers_for_one_file_is_a_structural_error() {
    let fixture = Fixture::new();
    let setup = fixture.write("setup.pack", &pack(&[("a.dll", b"MZ-a")]));

    let registry = HandlerRegistry::new();
    registry.register(Arc::new(PackHandler::default())).unwrap();
    registry.register(Arc::new(ShadowPack)).unwrap();
    let signer = RecursiveSigner::new(
        Arc::new(registry),
        Arc::new(ContentAnalyzer),
        Arc::new(ExtensionPolicy),
        fixture.provider.clone(),
    );

    let err = signer
        .sign(
            SigningRequest::new(vec![setup], fixture.config()),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    match err {
        SigningError::AmbiguousHandler { handlers, .. } => {
            assert_eq!(handlers, vec!["pack".to_string(), "shadow-pack".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(fixture.provider.batches().is_empty());
}

#[tokio::test]
async fn test_missing_root_is_reported_and_others_still_signed() {
    let fixture = Fixture::new();
    let present = fixture.write("present.dll", b"MZ-present");
    let missing = fixture.path("missing.dll");

    let result = fixture.sign(vec![missing.clone(), present.clone()]).await;
    assert!(!result.success);
    assert_eq!(result.root(&present).unwrap().state, NodeState::Signed);
    assert!(signed_with(&fixture.read("present.dll"), "Cert-dll"));

    assert_eq!(result.failures.len(), 1);
    let failure = &result.failures[0];
    assert_eq!(failure.node, None);
    assert_eq!(failure.stage, Stage::Discovery);
    assert_eq!(failure.path, missing);
}

#[tokio::test]
async fn test_invalid_configuration_is_rejected_before_any_work() {
    let fixture = Fixture::new();
    let a = fixture.write("a.dll", b"MZ-a");
    let config = SigningConfiguration {
        max_concurrent_batches: 0,
        ..fixture.config()
    };

    let err = fixture
        .signer()
        .sign(SigningRequest::new(vec![a], config), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SigningError::Config(_)));
    assert!(!fixture.temp_dir().exists());
}

/// Reports, for each container file name, entries carrying the given content keys.
struct KeyedEntries {
    entries: HashMap<String, Vec<(String, ContentKey)>>,
}

#[async_trait]
impl ContainerHandler for KeyedEntries {
    fn name(&self) -> &str {
        "keyed"
    }

    fn can_handle(&self, path: &Path) -> bool {
        path.extension().is_some_and(|e| e == "pack")
    }

    async fn read_entries(&self, path: &Path) -> anyhow::Result<(ContainerMetadata, EntryStream)> {
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        let entries: Vec<anyhow::Result<ContainerEntry>> = self
            .entries
            .get(&name)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|(entry, key)| Ok(ContainerEntry::new(entry, Cursor::new(Vec::new())).with_content_key(key)))
            .collect();
        Ok((ContainerMetadata::new("keyed"), futures::stream::iter(entries).boxed()))
    }

    async fn write_container(
        &self,
        _destination: &Path,
        _source: &Path,
        _entries: &[RepackEntry],
        _metadata: &ContainerMetadata,
    ) -> anyhow::Result<()> {
        anyhow::bail!("keyed containers are never rewritten")
    }
}

#[tokio::test]
async fn test_containers_waiting_on_each_other_stall_the_run() {
    let fixture = Fixture::new();
    let left = fixture.write("left.pack", b"left container");
    let right = fixture.write("right.pack", b"right container");

    let handler = KeyedEntries {
        entries: HashMap::from([
            (
                "left.pack".to_string(),
                vec![("inner/right.pack".to_string(), ContentKey::of_bytes(b"right container"))],
            ),
            (
                "right.pack".to_string(),
                vec![("inner/left.pack".to_string(), ContentKey::of_bytes(b"left container"))],
            ),
        ]),
    };
    let registry = HandlerRegistry::new();
    registry.register(Arc::new(handler)).unwrap();
    let signer = RecursiveSigner::new(
        Arc::new(registry),
        Arc::new(ContentAnalyzer),
        Arc::new(ExtensionPolicy),
        fixture.provider.clone(),
    );

    let err = signer
        .sign(
            SigningRequest::new(vec![left, right], fixture.config()),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    match err {
        SigningError::Stalled { pending } => assert_eq!(pending, 2),
        other => panic!("unexpected error: {other}"),
    }
    assert!(fixture.provider.batches().is_empty());
}
