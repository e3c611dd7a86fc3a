use super::support::{pack, pack_entry, signed_with, Fixture};
use nestsign::{NodeId, NodeState, SigningResult};
use std::collections::{HashMap, HashSet};

fn nested_setup(fixture: &Fixture) -> std::path::PathBuf {
    let inner = pack(&[("c.dll", b"MZ-c"), ("a.dll", b"MZ-shared")]);
    fixture.write(
        "setup.pack",
        &pack(&[
            ("lib/a.dll", b"MZ-shared"),
            ("lib/b.dll", b"MZ-shared"),
            ("readme.txt", b"hello"),
            ("nested/inner.pack", &inner),
        ]),
    )
}

#[tokio::test]
async fn test_nested_container_is_signed_inside_out() {
    let fixture = Fixture::new();
    let setup = nested_setup(&fixture);

    let result = fixture.sign(vec![setup]).await;
    assert!(result.success, "failures: {:?}", result.failures);
    assert!(result.failures.is_empty());

    // Shared content signed once; every container signed after its repack.
    assert_eq!(
        fixture.provider.signed_names(),
        vec!["a.dll", "c.dll", "inner.pack", "setup.pack"]
    );

    let outer = fixture.read("setup.pack");
    assert!(signed_with(&outer, "Cert-pack"));

    let a = pack_entry(&outer, "lib/a.dll");
    let b = pack_entry(&outer, "lib/b.dll");
    assert!(signed_with(&a, "Cert-dll"));
    assert_eq!(a, b);
    assert_eq!(pack_entry(&outer, "readme.txt"), b"hello");

    let inner = pack_entry(&outer, "nested/inner.pack");
    assert!(signed_with(&inner, "Cert-pack"));
    assert_eq!(pack_entry(&inner, "a.dll"), a);
    assert!(signed_with(&pack_entry(&inner, "c.dll"), "Cert-dll"));

    assert_eq!(result.stats.deduplicated, 2);
    assert_eq!(result.stats.skipped, 1);
    assert_eq!(result.stats.repacked, 2);
    assert_eq!(result.stats.total_nodes, 7);
    assert!(result.nodes.iter().all(|n| n.state.is_terminal()));
}

/// Index of the transition at which `node` became terminal
fn terminal_at(result: &SigningResult, node: NodeId) -> usize {
    result
        .transitions
        .iter()
        .position(|t| t.node == node && t.to.is_terminal())
        .unwrap_or_else(|| panic!("{node} never became terminal"))
}

#[tokio::test]
async fn test_descendants_are_terminal_before_container_repacks() {
    let fixture = Fixture::new();
    let setup = nested_setup(&fixture);
    let result = fixture.sign(vec![setup]).await;
    assert!(result.success);

    let parents: HashMap<NodeId, Option<NodeId>> =
        result.nodes.iter().map(|n| (n.id, n.parent)).collect();
    let is_descendant = |mut node: NodeId, ancestor: NodeId| {
        while let Some(Some(parent)) = parents.get(&node) {
            if *parent == ancestor {
                return true;
            }
            node = *parent;
        }
        false
    };

    let containers: Vec<_> = result
        .nodes
        .iter()
        .filter(|n| n.container_format.is_some())
        .collect();
    assert_eq!(containers.len(), 2);

    for container in containers {
        let repacked = result
            .transitions
            .iter()
            .position(|t| t.node == container.id && t.to == NodeState::Repacked)
            .expect("container was repacked");
        for node in result.nodes.iter().filter(|n| is_descendant(n.id, container.id)) {
            assert!(terminal_at(&result, node.id) < repacked);
            if let Some(canonical) = node.canonical {
                assert!(terminal_at(&result, canonical) < repacked);
            }
        }
        // Never signed before being repacked.
        let signing = result
            .transitions
            .iter()
            .position(|t| t.node == container.id && t.to == NodeState::Signing)
            .expect("container was signed");
        assert!(repacked < signing);
    }
}

#[tokio::test]
async fn test_identical_roots_are_signed_once_and_match() {
    let fixture = Fixture::new();
    let x = fixture.write("x.dll", b"MZ-same");
    let y = fixture.write("y.dll", b"MZ-same");

    let result = fixture.sign(vec![x, y.clone()]).await;
    assert!(result.success);
    assert_eq!(fixture.provider.signed_targets().len(), 1);
    assert_eq!(fixture.read("x.dll"), fixture.read("y.dll"));
    assert!(signed_with(&fixture.read("y.dll"), "Cert-dll"));

    let alias = result.root(&y).unwrap();
    assert_eq!(alias.state, NodeState::Deduplicated);
    assert_eq!(result.outputs.len(), 2);
    assert!(result.outputs.iter().any(|o| o.path == y && o.reused));
}

#[tokio::test]
async fn test_unchanged_and_empty_containers_skip_the_handler() {
    let fixture = Fixture::new();
    let docs = fixture.write("docs.pack", &pack(&[("readme.txt", b"read me")]));
    let empty = fixture.write("empty.pack", &pack(&[]));

    let result = fixture.sign(vec![docs, empty]).await;
    assert!(result.success);
    assert_eq!(fixture.handler.writes(), 0);
    assert_eq!(result.stats.repacked, 0);

    let docs = fixture.read("docs.pack");
    assert!(signed_with(&docs, "Cert-pack"));
    assert_eq!(pack_entry(&docs, "readme.txt"), b"read me");
    assert!(signed_with(&fixture.read("empty.pack"), "Cert-pack"));
}

#[tokio::test]
async fn test_batches_are_chunked() {
    let fixture = Fixture::new();
    let inputs: Vec<_> = (0..5)
        .map(|i| fixture.write(&format!("f{i}.dll"), format!("MZ-{i}").as_bytes()))
        .collect();
    let config = nestsign::SigningConfiguration {
        max_batch_size: 2,
        ..fixture.config()
    };

    let result = fixture.sign_with(inputs, config).await;
    assert!(result.success);

    let mut sizes: Vec<usize> = fixture.provider.batches().iter().map(Vec::len).collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![1, 2, 2]);
    assert_eq!(result.stats.batches, 3);
    assert_eq!(result.stats.signed, 5);
}

#[tokio::test]
async fn test_workspace_removed_unless_kept() {
    let fixture = Fixture::new();
    let setup = nested_setup(&fixture);
    fixture.sign(vec![setup.clone()]).await;
    assert_eq!(std::fs::read_dir(fixture.temp_dir()).unwrap().count(), 0);

    let fixture = Fixture::new();
    let setup = nested_setup(&fixture);
    let config = nestsign::SigningConfiguration {
        keep_workspace: true,
        ..fixture.config()
    };
    let result = fixture.sign_with(vec![setup], config).await;

    let kept: HashSet<_> = std::fs::read_dir(fixture.temp_dir())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(kept.len(), 1);
    assert!(kept.iter().all(|name| name.starts_with("nestsign-")));

    let c = result.entries("c.dll").next().unwrap();
    assert!(signed_with(&std::fs::read(&c.path).unwrap(), "Cert-dll"));
}
