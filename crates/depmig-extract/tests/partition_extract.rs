use depmig_core::Division;
use depmig_extract::{load_partition, partition_extract};
use depmig_storage::{ArtifactStore, PartitionManifest, MANIFEST_FILE_NAME};
use tempfile::tempdir;

fn write(dir: &std::path::Path, name: &str, body: &str) {
    std::fs::write(dir.join(name), body).expect("write fixture");
}

#[tokio::test]
async fn partitions_both_divisions_into_per_report_artifacts() {
    let extract = tempdir().expect("tempdir");
    let output = tempdir().expect("tempdir");
    write(
        extract.path(),
        "reports.json",
        r#"[{"ID": 1, "Reference": "R-001"}, {"ID": "2", "Reference": "R-002"}]"#,
    );
    write(
        extract.path(),
        "div-40-all.json",
        r#"[
            {"ReportID": 1, "Name": "Oven", "HundredPercentOption": "0"},
            {"ReportID": 3, "Name": "Orphan"},
            {"ReportID": 1, "Name": "Cooktop"}
        ]"#,
    );
    write(
        extract.path(),
        "div-43-all.json",
        r#"[{"ReportID": "2", "Name": "Slab", "Area": 0}]"#,
    );

    let store = ArtifactStore::new(output.path());
    let summary = partition_extract(extract.path(), &store).await.expect("partition");

    assert_eq!(summary.reports, 2);
    assert_eq!(summary.artifacts, 2);
    assert_eq!(summary.assets_written, 3);
    assert_eq!(summary.assets_dropped, 1);
    assert_eq!(summary.stale_removed, 0);

    assert!(output.path().join("div-40-1.json").exists());
    assert!(output.path().join("div-43-2.json").exists());
    assert!(!output.path().join("div-40-2.json").exists());
    assert!(!output.path().join("div-43-1.json").exists());

    let oven_first = load_partition(&store, Division::Div40, "1").await.expect("load");
    let names: Vec<_> = oven_first.iter().filter_map(|a| a.name.text()).collect();
    assert_eq!(names, vec!["Oven", "Cooktop"]);
    assert!(load_partition(&store, Division::Div43, "1").await.expect("load").is_empty());

    let manifest: PartitionManifest = store
        .load_json(MANIFEST_FILE_NAME)
        .await
        .expect("manifest read")
        .expect("manifest present");
    assert_eq!(manifest.files.len(), 2);
    let bytes = std::fs::read(output.path().join("div-40-1.json")).unwrap();
    let entry = manifest
        .files
        .iter()
        .find(|f| f.division == Division::Div40)
        .expect("div 40 entry");
    assert_eq!(entry.sha256, ArtifactStore::sha256_hex(&bytes));
    assert_eq!(entry.assets, 2);
}

#[tokio::test]
async fn missing_asset_extract_is_fatal() {
    let extract = tempdir().expect("tempdir");
    let output = tempdir().expect("tempdir");
    write(extract.path(), "reports.json", r#"[{"ID": 1, "Reference": "R-001"}]"#);

    let store = ArtifactStore::new(output.path());
    let err = partition_extract(extract.path(), &store)
        .await
        .expect_err("missing div-40-all.json");
    assert!(format!("{err:#}").contains("div-40-all.json"));
}

#[tokio::test]
async fn unparseable_reports_are_fatal() {
    let extract = tempdir().expect("tempdir");
    let output = tempdir().expect("tempdir");
    write(extract.path(), "reports.json", "{not json");

    let store = ArtifactStore::new(output.path());
    let err = partition_extract(extract.path(), &store).await.expect_err("bad json");
    assert!(format!("{err:#}").contains("parsing"));
}

#[tokio::test]
async fn repartition_removes_artifacts_of_reports_that_lost_their_assets() {
    let extract = tempdir().expect("tempdir");
    let output = tempdir().expect("tempdir");
    write(extract.path(), "reports.json", r#"[{"ID": 1, "Reference": "R-001"}]"#);
    write(extract.path(), "div-40-all.json", r#"[{"ReportID": 1, "Name": "Oven"}]"#);
    write(extract.path(), "div-43-all.json", "[]");

    let store = ArtifactStore::new(output.path());
    partition_extract(extract.path(), &store).await.expect("first partition");
    assert_eq!(load_partition(&store, Division::Div40, "1").await.expect("load").len(), 1);

    write(extract.path(), "div-40-all.json", "[]");
    let summary = partition_extract(extract.path(), &store).await.expect("second partition");

    assert_eq!(summary.artifacts, 0);
    assert_eq!(summary.stale_removed, 1);
    assert!(!output.path().join("div-40-1.json").exists());
    assert!(load_partition(&store, Division::Div40, "1").await.expect("load").is_empty());
}

#[tokio::test]
async fn repartition_into_the_extract_directory_keeps_the_extracts() {
    let dir = tempdir().expect("tempdir");
    write(dir.path(), "reports.json", r#"[{"ID": 1, "Reference": "R-001"}]"#);
    write(dir.path(), "div-40-all.json", r#"[{"ReportID": 1, "Name": "Oven"}]"#);
    write(dir.path(), "div-43-all.json", "[]");

    let store = ArtifactStore::new(dir.path());
    partition_extract(dir.path(), &store).await.expect("first partition");
    let summary = partition_extract(dir.path(), &store).await.expect("second partition");

    assert_eq!(summary.stale_removed, 0);
    assert!(dir.path().join("div-40-all.json").exists());
    assert!(dir.path().join("div-43-all.json").exists());
    assert!(dir.path().join("div-40-1.json").exists());
}

#[tokio::test]
async fn similar_report_ids_get_their_own_artifacts() {
    let extract = tempdir().expect("tempdir");
    let output = tempdir().expect("tempdir");
    write(
        extract.path(),
        "reports.json",
        r#"[{"ID": "A/1", "Reference": "R-001"}, {"ID": "A_1", "Reference": "R-002"}]"#,
    );
    write(
        extract.path(),
        "div-40-all.json",
        r#"[{"ReportID": "A/1", "Name": "Oven"}, {"ReportID": "A_1", "Name": "Slab"}]"#,
    );
    write(extract.path(), "div-43-all.json", "[]");

    let store = ArtifactStore::new(output.path());
    let summary = partition_extract(extract.path(), &store).await.expect("partition");
    assert_eq!(summary.artifacts, 2);

    let names = |assets: Vec<depmig_core::RawAsset>| -> Vec<String> {
        assets.iter().filter_map(|a| a.name.text()).map(ToString::to_string).collect()
    };
    let slashed = load_partition(&store, Division::Div40, "A/1").await.expect("load");
    let underscored = load_partition(&store, Division::Div40, "A_1").await.expect("load");
    assert_eq!(names(slashed), vec!["Oven"]);
    assert_eq!(names(underscored), vec!["Slab"]);
}
