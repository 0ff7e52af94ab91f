use std::fs;

use camino::Utf8PathBuf;

use esgf_harvest::domain::EntityKind;
use esgf_harvest::record::Record;
use esgf_harvest::report::{FILE_COLUMNS, dedup_file_list, write_file_list};

fn temp_path(dir: &tempfile::TempDir, name: &str) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().join(name)).unwrap()
}

#[test]
fn file_list_has_documented_columns() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp_path(&temp, "out/files.csv");

    let mut record = Record::new("tas_day.nc|node.example.org")
        .with_extra("project", "CMIP5")
        .with_extra("_version_", 1_700_000_000u64);
    record.kind = Some(EntityKind::File);
    record.title = Some("tas_day.nc".to_string());
    record.size = Some(1024);
    record.url = vec![
        "gsiftp://node.example.org/tas_day.nc|application/gridftp|GridFTP".to_string(),
        "http://node.example.org/tas_day.nc|application/netcdf|HTTPServer".to_string(),
    ];
    write_file_list(&path, &[record]).unwrap();

    let mut reader = csv::Reader::from_path(path.as_std_path()).unwrap();
    let headers = reader.headers().unwrap().clone();
    assert_eq!(headers.iter().collect::<Vec<_>>(), FILE_COLUMNS);

    let row = reader.records().next().unwrap().unwrap();
    let column = |name: &str| {
        let index = FILE_COLUMNS.iter().position(|column| *column == name).unwrap();
        row.get(index).unwrap().to_string()
    };
    assert_eq!(column("filename"), "tas_day.nc");
    assert_eq!(column("project"), "CMIP5");
    assert_eq!(column("_version_"), "1700000000");
    assert_eq!(column("size"), "1024");
    assert_eq!(column("type"), "File");
    assert_eq!(column("url"), "http://node.example.org/tas_day.nc");
    assert_eq!(column("experiment"), "");
}

#[test]
fn dedup_keeps_latest_version_per_file() {
    let temp = tempfile::tempdir().unwrap();
    let input = temp_path(&temp, "files.csv");
    let output = temp_path(&temp, "dedup.csv");
    fs::write(
        input.as_std_path(),
        "filename,dataset_version,_version_,url\n\
         tas.nc,20120101,5,old\n\
         tas.nc,20130101,1,newer_dataset\n\
         tas.nc,20130101,3,newest\n\
         pr.nc,9,1,nine\n\
         pr.nc,10,1,ten\n",
    )
    .unwrap();

    let summary = dedup_file_list(&input, &output).unwrap();
    assert_eq!(summary.rows_read, 5);
    assert_eq!(summary.rows_written, 2);

    let mut reader = csv::Reader::from_path(output.as_std_path()).unwrap();
    let rows = reader
        .records()
        .map(|row| {
            let row = row.unwrap();
            (row[0].to_string(), row[3].to_string())
        })
        .collect::<Vec<_>>();
    assert_eq!(
        rows,
        [
            ("pr.nc".to_string(), "ten".to_string()),
            ("tas.nc".to_string(), "newest".to_string()),
        ]
    );
}

#[test]
fn dedup_requires_key_columns() {
    let temp = tempfile::tempdir().unwrap();
    let input = temp_path(&temp, "files.csv");
    let output = temp_path(&temp, "dedup.csv");
    fs::write(input.as_std_path(), "filename,url\na.nc,x\n").unwrap();
    assert!(dedup_file_list(&input, &output).is_err());
}
