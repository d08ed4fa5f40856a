//! Test: Property Forwarding - what a triggered child sees of its parent

use crate::helpers::*;
use jobgraph::core::{BuildResult, PropertyValue};

const YAML: &str = r#"
name: "Test: Property Forwarding"
settings:
  workers: [{ name: worker1 }]
builders:
  - name: parent
    default_properties:
      target: develop
      host: bb-host
    steps:
      - name: name
        set_property:
          property: name
          value: "%(prop:box)s-%(prop:buildnumber)s"
      - name: forward
        trigger:
          schedulers: [child]
          wait_for_finish: true
          copy_properties: [box, target, name, missing]
          set_properties:
            target: "%(prop:target)s-override"
            test_branch: { property: branch }
            test_set: { property: test_set, default: "-L LIGHT" }
            host: { property: host, replace: { bb-host: max-gcloud } }
            absent: { property: nowhere }
  - name: child
    properties:
      product: mariadb
    default_properties:
      box: default_box
      version: "10.6"
    steps:
      - name: echo
        shell: "echo %(prop:box)s %(prop:target)s"
schedulers:
  - name: child
    kind: triggerable
    builders: [child]
    properties:
      owners: ci-team
      target: from-scheduler
"#;

async fn run(requested: &[(&str, &str)]) -> jobgraph::BuildRecord {
    let engine = engine_with(YAML, &[MockWorker::new("worker1")]);
    let record = engine.invoke("parent", props(requested)).await.unwrap();
    assert_build_status(&record, BuildResult::Success);
    record
}

/// Test that only the listed keys are copied, and only when present
#[tokio::test]
async fn test_copy_only_listed_present_keys() {
    let record = run(&[("box", "centos_8"), ("branch", "develop"), ("secret", "x")]).await;
    let child = child(&record, "child");

    assert_property(child, "box", "centos_8");
    assert_property(child, "name", "centos_8-1");
    assert!(!child.properties.contains("missing"));
    assert!(!child.properties.contains("secret"));
    assert!(!child.properties.contains("branch"));
}

/// Test that computed properties override copied ones
#[tokio::test]
async fn test_set_properties_override_copies() {
    let record = run(&[("box", "centos_8"), ("branch", "develop")]).await;
    let child = child(&record, "child");

    assert_property(child, "target", "develop-override");
    assert_property(child, "test_branch", "develop");
    assert_eq!(child.properties.source("test_branch"), Some("Trigger"));
}

/// Test property references with defaults and value substitution
#[tokio::test]
async fn test_property_reference_defaults_and_replace() {
    let record = run(&[("box", "centos_8"), ("branch", "develop")]).await;
    let child = child(&record, "child");

    assert_property(child, "test_set", "-L LIGHT");
    assert_property(child, "host", "max-gcloud");
    assert_eq!(child.properties.get("absent"), Some(&PropertyValue::Null));

    let record = run(&[
        ("box", "centos_8"),
        ("test_set", "-R mxs_basic"),
        ("host", "other-host"),
    ])
    .await;
    let child = crate::helpers::child(&record, "child");
    assert_property(child, "test_set", "-R mxs_basic");
    assert_property(child, "host", "other-host");
    // a reference to an unset property without a default yields null
    assert_eq!(child.properties.get("test_branch"), Some(&PropertyValue::Null));
}

/// Test the layering of scheduler, trigger and builder properties in the child
#[tokio::test]
async fn test_child_property_layering() {
    let record = run(&[("branch", "develop")]).await;
    let child = child(&record, "child");

    // scheduler properties sit below the forwarded ones
    assert_property(child, "owners", "ci-team");
    assert_property(child, "target", "develop-override");
    // builder properties always win, defaults only fill gaps
    assert_property(child, "product", "mariadb");
    assert_eq!(child.properties.source("product"), Some("Builder"));
    assert_property(child, "version", "10.6");
    assert_property(child, "box", "default_box");
}

/// Test that build identity is the child's own, never the parent's
#[tokio::test]
async fn test_builtins_are_not_inherited() {
    let record = run(&[("box", "centos_8")]).await;
    let child = child(&record, "child");

    assert_property(child, "buildername", "child");
    assert_property(child, "scheduler", "child");
    assert_property(child, "builddir", "workers/worker1/child");
    assert_eq!(child.properties.get("buildnumber"), Some(&PropertyValue::Int(1)));
    assert_eq!(child.properties.source("buildername"), Some("Build"));
    assert!(!record.properties.contains("scheduler"));
}

/// Test that the parent's bag is untouched by its child
#[tokio::test]
async fn test_parent_bag_unchanged_by_child() {
    let record = run(&[("box", "centos_8"), ("branch", "develop")]).await;

    assert_property(&record, "target", "develop");
    assert_property(&record, "host", "bb-host");
    assert!(!record.properties.contains("test_branch"));
    assert!(!record.properties.contains("product"));
}

/// Test that a property set by a step is visible to later steps and children
#[tokio::test]
async fn test_step_updates_visible_downstream() {
    let worker = MockWorker::new("worker1");
    let engine = engine_with(YAML, &[worker.clone()]);

    let record = engine
        .invoke("parent", props(&[("box", "rocky_9")]))
        .await
        .unwrap();

    assert_property(&record, "name", "rocky_9-1");
    assert_eq!(record.properties.source("name"), Some("name"));
    assert_eq!(worker.command_lines(), vec!["sh -c echo rocky_9 develop-override"]);
}
