use std::io::{Cursor, Write};
use std::sync::Arc;

use field_trial_ingest::db;
use field_trial_ingest::gis::normalize_gis_file;
use field_trial_ingest::ingest::{IngestRequest, Ingestor};
use field_trial_ingest::migrate;
use field_trial_ingest::models::{DataType, IngestStatus, RejectionKind, UploadContent};
use field_trial_ingest::store::memory::InMemoryStore;
use field_trial_ingest::store::sqlite::SqliteStore;
use field_trial_ingest::store::Store;
use serde_json::json;
use tempfile::TempDir;

const SOIL_CSV: &str = "\
Sample No,Date,Depth,Soil pH,OM %
S1,2024-01-05,0-6,6.5,3.1
S2,2024-01-05,0-6,6.8,2.9
S3,2024-01-05,6-12,7.0,2.2
";

/// Both store implementations, each with its temp dir kept alive.
async fn stores() -> Vec<(&'static str, Arc<dyn Store>, Option<TempDir>)> {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect_path(&tmp.path().join("data/trials.sqlite"))
        .await
        .unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    let memory: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let sqlite: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));
    vec![("memory", memory, None), ("sqlite", sqlite, Some(tmp))]
}

fn text(body: &str) -> UploadContent {
    UploadContent::Text(body.to_string())
}

#[tokio::test]
async fn reingesting_the_same_file_is_idempotent() {
    for (name, store, _tmp) in stores().await {
        store.register_trial("T-100", None).await.unwrap();
        let ingestor = Ingestor::new(store.clone());
        let request = || IngestRequest::new("Soil Health Data.csv", text(SOIL_CSV)).trial("T-100");

        let first = ingestor.ingest(request()).await;
        assert_eq!(first.status, IngestStatus::Success, "{}: {}", name, first.detail);
        assert_eq!(first.data_type, DataType::SoilHealth);
        assert_eq!(first.records_accepted, 3);

        let second = ingestor.ingest(request()).await;
        assert_eq!(second.status, IngestStatus::Error, "{}", name);
        assert_eq!(second.records_accepted, 0);
        assert_eq!(second.records_rejected, 3);
        assert_eq!(second.duplicates, 3);
        assert!(second
            .rejections
            .iter()
            .all(|r| r.kind == RejectionKind::Duplicate));

        assert_eq!(store.row_count("T-100", DataType::SoilHealth).await.unwrap(), 3, "{}", name);
        let coverage = store.coverage("T-100").await.unwrap();
        assert!(coverage
            .iter()
            .any(|f| f.data_type == DataType::SoilHealth && f.has_data));

        let log = store.upload_log(Some("T-100"), 10).await.unwrap();
        assert_eq!(log.len(), 2, "{}", name);
        assert_eq!(log[0].status, IngestStatus::Error);
        assert_eq!(log[0].content_sha256, log[1].content_sha256);
    }
}

#[tokio::test]
async fn missing_required_values_give_partial_results() {
    for (name, store, _tmp) in stores().await {
        store.register_trial("T-1", None).await.unwrap();
        let ingestor = Ingestor::new(store.clone());
        let result = ingestor
            .ingest(
                IngestRequest::new(
                    "samples.csv",
                    text("Sample No,Date,Block\nS1,2024-01-05,A\n,2024-01-06,B\n"),
                )
                .trial("T-1")
                .data_type(DataType::SampleMetadata),
            )
            .await;

        assert_eq!(result.status, IngestStatus::Partial, "{}: {}", name, result.detail);
        assert_eq!(result.records_accepted, 1);
        assert_eq!(result.records_rejected, 1);
        assert_eq!(result.rejections[0].row_index, 2);
        assert_eq!(result.rejections[0].kind, RejectionKind::Invalid);
        assert_eq!(result.rejections[0].reason, "row 2: missing sample_no");

        let rows = store.rows("T-1", DataType::SampleMetadata).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields["sample_date"], json!("2024-01-05"));
    }
}

#[tokio::test]
async fn trials_registered_in_any_case_match_ingested_ids() {
    for (name, store, _tmp) in stores().await {
        assert!(store.register_trial("  t-1 ", None).await.unwrap(), "{}", name);
        assert!(!store.register_trial("T-1", None).await.unwrap(), "{}", name);
        assert!(store.trial_exists("t-1").await.unwrap(), "{}", name);
        assert!(store.register_trial("  ", None).await.is_err(), "{}", name);

        let trials = store.trials().await.unwrap();
        assert_eq!(trials.len(), 1, "{}", name);
        assert_eq!(trials[0].id, "T-1");

        let result = Ingestor::new(store.clone())
            .ingest(IngestRequest::new("Soil Health Data.csv", text(SOIL_CSV)).trial("T-1"))
            .await;
        assert_eq!(result.status, IngestStatus::Success, "{}: {}", name, result.detail);
    }
}

#[tokio::test]
async fn unknown_trial_loads_nothing() {
    for (name, store, _tmp) in stores().await {
        let ingestor = Ingestor::new(store.clone());
        let result = ingestor
            .ingest(IngestRequest::new("Soil Health Data.csv", text(SOIL_CSV)).trial("T-404"))
            .await;
        assert_eq!(result.status, IngestStatus::Error, "{}", name);
        assert!(result.detail.contains("trial not found"), "{}", result.detail);
        assert_eq!(store.row_count("T-404", DataType::SoilHealth).await.unwrap(), 0);
        assert!(store.coverage("T-404").await.unwrap().is_empty());

        let log = store.upload_log(None, 10).await.unwrap();
        assert_eq!(log.len(), 1, "{}", name);
        assert_eq!(log[0].trial_id.as_deref(), Some("T-404"));
    }
}

#[tokio::test]
async fn trial_id_column_is_used_when_none_is_given() {
    for (name, store, _tmp) in stores().await {
        store.register_trial("T-5", None).await.unwrap();
        let ingestor = Ingestor::new(store.clone());
        let result = ingestor
            .ingest(IngestRequest::new(
                "Plot Data.csv",
                text("Trial ID,Plot,Yield\nn/a,101,50\nt-5,102,55\n"),
            ))
            .await;
        assert_eq!(result.status, IngestStatus::Success, "{}: {}", name, result.detail);
        assert_eq!(result.trial_id.as_deref(), Some("T-5"));
        assert_eq!(result.records_accepted, 2);
    }
}

#[tokio::test]
async fn purge_resets_coverage() {
    for (name, store, _tmp) in stores().await {
        store.register_trial("T-2", None).await.unwrap();
        let ingestor = Ingestor::new(store.clone());
        ingestor
            .ingest(IngestRequest::new("Soil Health Data.csv", text(SOIL_CSV)).trial("T-2"))
            .await;

        assert_eq!(store.delete_rows("T-2", DataType::SoilHealth).await.unwrap(), 3, "{}", name);
        let flag = store
            .coverage("T-2")
            .await
            .unwrap()
            .into_iter()
            .find(|f| f.data_type == DataType::SoilHealth)
            .unwrap();
        assert!(!flag.has_data, "{}", name);

        // Rows come back after a purge
        let again = ingestor
            .ingest(IngestRequest::new("Soil Health Data.csv", text(SOIL_CSV)).trial("T-2"))
            .await;
        assert_eq!(again.records_accepted, 3, "{}", name);
    }
}

#[tokio::test]
async fn concurrent_uploads_of_one_file_insert_each_row_once() {
    let store = Arc::new(InMemoryStore::new());
    store.register_trial("T-3", None).await.unwrap();
    let ingestor = Arc::new(Ingestor::new(store.clone()));

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let ingestor = ingestor.clone();
            tokio::spawn(async move {
                ingestor
                    .ingest(IngestRequest::new("Soil Health Data.csv", text(SOIL_CSV)).trial("T-3"))
                    .await
            })
        })
        .collect();

    let mut accepted = 0;
    for task in tasks {
        accepted += task.await.unwrap().records_accepted;
    }
    assert_eq!(accepted, 3);
    assert_eq!(store.row_count("T-3", DataType::SoilHealth).await.unwrap(), 3);
}

// ---------------------------------------------------------------------------
// XLSX
// ---------------------------------------------------------------------------

fn inline_sheet(rows: &[&[&str]]) -> String {
    let mut xml = String::from("<worksheet><sheetData>");
    for (r, row) in rows.iter().enumerate() {
        xml.push_str(&format!("<row r=\"{}\">", r + 1));
        for (c, value) in row.iter().enumerate() {
            if value.is_empty() {
                continue;
            }
            let col = (b'A' + c as u8) as char;
            xml.push_str(&format!(
                "<c r=\"{}{}\" t=\"inlineStr\"><is><t>{}</t></is></c>",
                col,
                r + 1,
                value
            ));
        }
        xml.push_str("</row>");
    }
    xml.push_str("</sheetData></worksheet>");
    xml
}

fn workbook(sheets: &[(&str, String)]) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(Cursor::new(&mut buf));
        let opts = zip::write::SimpleFileOptions::default();
        let mut wb = String::from("<workbook><sheets>");
        let mut rels = String::from("<Relationships>");
        for (i, (name, xml)) in sheets.iter().enumerate() {
            wb.push_str(&format!(
                "<sheet name=\"{}\" sheetId=\"{}\" r:id=\"rId{}\"/>",
                name,
                i + 1,
                i + 1
            ));
            rels.push_str(&format!(
                "<Relationship Id=\"rId{}\" Target=\"worksheets/sheet{}.xml\"/>",
                i + 1,
                i + 1
            ));
            zip.start_file(format!("xl/worksheets/sheet{}.xml", i + 1), opts)
                .unwrap();
            zip.write_all(xml.as_bytes()).unwrap();
        }
        wb.push_str("</sheets></workbook>");
        rels.push_str("</Relationships>");
        zip.start_file("xl/workbook.xml", opts).unwrap();
        zip.write_all(wb.as_bytes()).unwrap();
        zip.start_file("xl/_rels/workbook.xml.rels", opts).unwrap();
        zip.write_all(rels.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    buf
}

#[tokio::test]
async fn xlsx_upload_with_serial_dates() {
    for (name, store, _tmp) in stores().await {
        store.register_trial("T-10", None).await.unwrap();
        let ingestor = Ingestor::new(store.clone());
        let bytes = workbook(&[
            ("Instructions", inline_sheet(&[&["Fill in the data sheet"]])),
            (
                "Soil Health",
                inline_sheet(&[
                    &["Sample No", "Date", "Depth", "OM %"],
                    &["S1", "45000", "0-6", "3.1"],
                    &["S2", "2023-03-16", "0-6", "oops"],
                ]),
            ),
        ]);
        let result = ingestor
            .ingest(
                IngestRequest::new("Soil Health Results.xlsx", UploadContent::Binary(bytes))
                    .trial("T-10"),
            )
            .await;
        assert_eq!(result.status, IngestStatus::Success, "{}: {}", name, result.detail);
        assert_eq!(result.records_accepted, 2);

        let rows = store.rows("T-10", DataType::SoilHealth).await.unwrap();
        let s1 = rows.iter().find(|r| r.fields["sample_no"] == json!("S1")).unwrap();
        assert_eq!(s1.fields["sample_date"], json!("2023-03-15"));
        assert_eq!(s1.fields["organic_matter"], json!(3.1));
        let s2 = rows.iter().find(|r| r.fields["sample_no"] == json!("S2")).unwrap();
        assert!(s2
            .fields
            .get("organic_matter")
            .map(|v| v.is_null())
            .unwrap_or(true));
    }
}

#[tokio::test]
async fn trial_summary_workbook_is_replaced_on_reupload() {
    for (name, store, _tmp) in stores().await {
        store.register_trial("T-8", Some("North farm")).await.unwrap();
        let ingestor = Ingestor::new(store.clone());
        let sheet = |crop: &str| {
            workbook(&[(
                "Trial Summary",
                inline_sheet(&[
                    &["Trial ID:", "t-8"],
                    &["Crop:", crop],
                    &["Planting Date:", "45000"],
                    &[""],
                    &["Trt No", "Product", "Rate"],
                    &["1", "Untreated check", ""],
                    &["2", "BioBoost", "2 qt/ac"],
                ]),
            )])
        };

        let first = ingestor
            .ingest(IngestRequest::new("Trial Summary.xlsx", UploadContent::Binary(sheet("Corn"))))
            .await;
        assert_eq!(first.status, IngestStatus::Success, "{}: {}", name, first.detail);
        assert_eq!(first.data_type, DataType::TrialSummary);
        assert_eq!(first.trial_id.as_deref(), Some("T-8"));

        let second = ingestor
            .ingest(IngestRequest::new("Trial Summary.xlsx", UploadContent::Binary(sheet("Soybean"))))
            .await;
        assert_eq!(second.status, IngestStatus::Success, "{}", name);

        let summary = store.trial_summary("T-8").await.unwrap().unwrap();
        assert_eq!(summary.metadata.get("crop").map(String::as_str), Some("Soybean"));
        assert_eq!(
            summary.metadata.get("planting_date").map(String::as_str),
            Some("2023-03-15")
        );
        assert_eq!(summary.treatments.len(), 2);
        assert!(store
            .coverage("T-8")
            .await
            .unwrap()
            .iter()
            .any(|f| f.data_type == DataType::TrialSummary && f.has_data));
    }
}

// ---------------------------------------------------------------------------
// GIS
// ---------------------------------------------------------------------------

fn point_shp(points: &[(f64, f64)]) -> Vec<u8> {
    let mut records = Vec::new();
    for (i, (x, y)) in points.iter().enumerate() {
        records.extend((i as i32 + 1).to_be_bytes());
        records.extend(10i32.to_be_bytes()); // 20 bytes of content
        records.extend(1i32.to_le_bytes());
        records.extend(x.to_le_bytes());
        records.extend(y.to_le_bytes());
    }
    let mut out = Vec::new();
    out.extend(9994i32.to_be_bytes());
    out.extend([0u8; 20]);
    out.extend((((100 + records.len()) / 2) as i32).to_be_bytes());
    out.extend(1000i32.to_le_bytes());
    out.extend(1i32.to_le_bytes());
    out.extend([0u8; 64]);
    out.extend(records);
    out
}

fn zip_of(members: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(Cursor::new(&mut buf));
        let opts = zip::write::SimpleFileOptions::default();
        for (name, data) in members {
            zip.start_file(*name, opts).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }
    buf
}

#[test]
fn shapefile_archive_with_two_layers() {
    let bytes = zip_of(&[
        ("probes.shp", point_shp(&[(-93.0, 42.0), (-93.1, 42.1)])),
        ("wells.shp", point_shp(&[(-94.0, 41.0), (f64::NAN, 41.0)])),
        ("__MACOSX/._probes.shp", vec![0; 8]),
    ]);
    let layers = normalize_gis_file("farm.zip", &bytes).unwrap();
    assert_eq!(layers.len(), 2);
    assert_eq!(layers[0].name, "probes");
    assert_eq!(layers[0].collection.len(), 2);
    assert_eq!(layers[1].name, "wells");
    assert_eq!(layers[1].stats.features_before, 2);
    assert_eq!(layers[1].stats.features_after, 1);

    let geojson = layers[0].collection.to_geojson();
    assert_eq!(geojson["type"], "FeatureCollection");
    assert_eq!(geojson["features"][0]["geometry"]["type"], "Point");
}

#[test]
fn same_named_layers_in_different_folders_get_distinct_names() {
    let bytes = zip_of(&[
        ("north/fields.shp", point_shp(&[(-93.0, 42.0)])),
        ("south/fields.shp", point_shp(&[(-94.0, 41.0), (-94.1, 41.1)])),
        ("east/Fields.shp", point_shp(&[(-92.0, 43.0)])),
    ]);
    let layers = normalize_gis_file("farm.zip", &bytes).unwrap();
    let names: Vec<&str> = layers.iter().map(|l| l.name.as_str()).collect();
    assert_eq!(names, vec!["fields", "fields_2", "Fields_3"]);
    assert_eq!(layers[1].collection.len(), 2);
}

#[test]
fn geojson_with_a_null_geometry_keeps_one_feature() {
    let doc = br#"{"type":"FeatureCollection","features":[
        {"type":"Feature","properties":{"plot":"101"},
         "geometry":{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,1],[0,0]]]}},
        {"type":"Feature","properties":{"plot":"102"},"geometry":null}
    ]}"#;
    let layers = normalize_gis_file("plots.geojson", doc).unwrap();
    assert_eq!(layers.len(), 1);
    assert_eq!(layers[0].collection.len(), 1);
    assert_eq!(layers[0].collection.features[0].properties["plot"], "101");
    assert_eq!(layers[0].stats.dropped(), 1);
}

#[test]
fn unsupported_gis_extension_is_rejected() {
    assert!(normalize_gis_file("plots.gpx", b"<gpx/>").is_err());
}
