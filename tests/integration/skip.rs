use super::support::{pack, Fixture};
use nestsign::{NodeState, SigningConfiguration};

#[tokio::test]
async fn test_node_without_certificate_is_skipped_not_failed() {
    let fixture = Fixture::new();
    let notes = fixture.write("notes.txt", b"plain text");
    let vendor = fixture.write("vendor.dll", b"MZ-vendor");
    let config = SigningConfiguration {
        exclude: vec!["vendor.dll".to_string()],
        ..fixture.config()
    };

    let result = fixture.sign_with(vec![notes.clone(), vendor.clone()], config).await;
    assert!(result.success);
    assert!(fixture.provider.batches().is_empty());
    assert_eq!(result.stats.skipped, 2);
    assert!(result.outputs.is_empty());

    for path in [&notes, &vendor] {
        let node = result.root(path).unwrap();
        assert_eq!(node.state, NodeState::Skipped);
        assert_eq!(node.certificate, None);
        assert!(!result
            .transitions
            .iter()
            .any(|t| t.node == node.id && t.to == NodeState::Signing));
    }
    assert_eq!(fixture.read("notes.txt"), b"plain text");
    assert_eq!(fixture.read("vendor.dll"), b"MZ-vendor");
}

#[tokio::test]
async fn test_container_without_outer_certificate_is_still_repacked() {
    let fixture = Fixture::new();
    let bundle = fixture.write("bundle.pack", &pack(&[("a.dll", b"MZ-a")]));
    let mut config = fixture.config();
    config.certificates.remove("pack");

    let result = fixture.sign_with(vec![bundle.clone()], config).await;
    assert!(result.success);
    assert_eq!(result.root(&bundle).unwrap().state, NodeState::Skipped);
    assert_eq!(fixture.handler.writes(), 1);
    assert_eq!(fixture.provider.signed_names(), vec!["a.dll"]);
}
