use geosource_core::formats::shapefile::dbf::DbfField;
use geosource_core::formats::shapefile::shp::ShapeType;
use geosource_core::formats::shapefile::{ShapeRecord, ShapefileWriter};
use geosource_core::models::{AttributeTable, Geometry};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn write_towns(dir: &Path) -> PathBuf {
    let path = dir.join("towns.shp");
    let records: Vec<_> = [("Alpha", 0.0, 0.0), ("Beta", 5.0, 5.0), ("Gamma", 10.0, 10.0)]
        .iter()
        .map(|(name, x, y)| {
            ShapeRecord::new(Some(Geometry::point(*x, *y)), AttributeTable::new().with("NAME", *name))
        })
        .collect();
    ShapefileWriter::new(ShapeType::Point)
        .field(DbfField::character("NAME", 20))
        .write(&path, &records)
        .unwrap();
    path
}

fn geosource(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_geosource"))
        .current_dir(dir)
        .env("RUST_LOG", "warn")
        .args(args)
        .output()
        .unwrap()
}

fn json_data(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let body: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(body["status"], "success");
    body["data"].clone()
}

fn names(collection: &Value) -> Vec<String> {
    collection["features"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["properties"]["NAME"].as_str().unwrap().to_string())
        .collect()
}

#[test]
fn test_tables_lists_shapefile_layer() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_towns(dir.path());

    let data = json_data(&geosource(dir.path(), &["--json", "tables", path.to_str().unwrap()]));
    assert_eq!(data["source"], "towns");
    assert_eq!(data["backend"], "shapefile");
    let tables = data["tables"].as_array().unwrap();
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0]["name"], "towns");
    assert_eq!(tables[0]["feature_count"], 3);
}

#[test]
fn test_query_with_bbox_and_where() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_towns(dir.path());
    let path = path.to_str().unwrap();

    let data = json_data(&geosource(dir.path(), &["--json", "query", path, "towns"]));
    assert_eq!(data["type"], "FeatureCollection");
    assert_eq!(names(&data), vec!["Alpha", "Beta", "Gamma"]);

    let data = json_data(&geosource(
        dir.path(),
        &["--json", "query", path, "towns", "--bbox", "-1,-1,6,6"],
    ));
    assert_eq!(names(&data), vec!["Alpha", "Beta"]);

    let data = json_data(&geosource(
        dir.path(),
        &["--json", "query", path, "towns", "--where", "NAME <> :skip", "--param", "skip=Beta"],
    ));
    assert_eq!(names(&data), vec!["Alpha", "Gamma"]);

    let data = json_data(&geosource(
        dir.path(),
        &["--json", "query", path, "towns", "--limit", "1", "--offset", "1"],
    ));
    assert_eq!(names(&data), vec!["Beta"]);
}

#[test]
fn test_hit_with_tolerance() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_towns(dir.path());
    let path = path.to_str().unwrap();

    let data = json_data(&geosource(
        dir.path(),
        &["--json", "hit", path, "towns", "5.2", "4.9", "--tolerance", "0.5"],
    ));
    assert_eq!(names(&data), vec!["Beta"]);

    let data = json_data(&geosource(dir.path(), &["--json", "hit", path, "towns", "-3", "-3"]));
    assert!(names(&data).is_empty());
}

#[test]
fn test_unknown_extension_fails() {
    let dir = tempfile::tempdir().unwrap();
    let output = geosource(dir.path(), &["tables", "roads.csv"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("roads.csv"), "stderr: {stderr}");
}

#[test]
fn test_catalogue_entry_by_name() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_towns(dir.path());
    let catalog = format!(
        "[[sources]]\nname = \"places\"\nkind = \"shapefile\"\npath = {:?}\n",
        path.to_str().unwrap()
    );
    std::fs::write(dir.path().join("sources.toml"), catalog).unwrap();

    let data = json_data(&geosource(dir.path(), &["--json", "tables", "places"]));
    assert_eq!(data["source"], "places");
    assert_eq!(data["tables"][0]["name"], "towns");
}
