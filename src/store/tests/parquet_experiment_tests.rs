use super::*;

use arrow::array::{Int64Array, StringArray};
use parquet::file::reader::{FileReader, SerializedFileReader};

use crate::store::ObsQuery;
use crate::unit_tests::fixtures::{
    expected_value, layer_batch, open_standard_experiment, parquet_bytes, unique_uri, write_experiment,
};
use crate::utils::file_interaction_local_and_cloud::register_memory_file;

async fn collect_pages(pages: ObsPages) -> Vec<RecordBatch> {
    pages.pages.try_collect().await.unwrap()
}

fn column_i64(batch: &RecordBatch, name: &str) -> Vec<i64> {
    let column = batch.column_by_name(name).unwrap();
    column.as_any().downcast_ref::<Int64Array>().unwrap().values().to_vec()
}

#[tokio::test]
async fn test_open_missing_experiment_is_transient() {
    let err = ParquetExperiment::open(&unique_uri("missing")).await.unwrap_err();
    assert!(err.is_transient(), "{:?}", err);
}

#[tokio::test]
async fn test_projected_read_filters_and_orders_columns() {
    let store = open_standard_experiment("pq-projected").await;
    let request = ObsRead::Projected {
        query: Some(ObsQuery::eq("tissue", "lung")),
        columns: vec!["donor".to_string(), "soma_joinid".to_string()],
    };
    let read = store.read_obs(request).await.unwrap();
    assert_eq!(read.schema.field(0).name(), "donor");
    assert_eq!(read.schema.field(1).name(), "soma_joinid");

    let pages = collect_pages(read).await;
    // 10 rows in pages of 3
    assert_eq!(pages.len(), 4);
    let mut ids: Vec<i64> = pages.iter().flat_map(|p| column_i64(p, "soma_joinid")).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![2, 3, 4, 9]);
    assert!(pages.iter().all(|p| p.num_columns() == 2));
}

#[tokio::test]
async fn test_unprojected_read_returns_every_column() {
    let store = open_standard_experiment("pq-unprojected").await;
    let read = store
        .read_obs(ObsRead::Unprojected { query: Some(ObsQuery::eq("donor", "d0")) })
        .await
        .unwrap();
    assert_eq!(read.schema.fields().len(), 3);
    let pages = collect_pages(read).await;
    let total: usize = pages.iter().map(|p| p.num_rows()).sum();
    // 0, 3, 6, 9
    assert_eq!(total, 4);
    let tissues = pages[0].column_by_name("tissue").unwrap();
    assert!(tissues.as_any().downcast_ref::<StringArray>().is_some());
}

#[tokio::test]
async fn test_unknown_columns_are_reported() {
    let store = open_standard_experiment("pq-unknown").await;
    let err = store
        .read_obs(ObsRead::Projected { query: None, columns: vec!["cell_type".to_string()] })
        .await
        .unwrap_err();
    match err {
        StoreError::UnknownColumn { column, available } => {
            assert_eq!(column, "cell_type");
            assert_eq!(available, vec!["soma_joinid", "tissue", "donor"]);
        }
        other => panic!("unexpected {:?}", other),
    }

    let err = store
        .read_obs(ObsRead::Unprojected { query: Some(ObsQuery::eq("assay", "10x")) })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::UnknownColumn { .. }));
}

#[tokio::test]
async fn test_open_layer_variants() {
    let store = open_standard_experiment("pq-layers").await;

    let x = store.open_layer("RNA", "X").await.unwrap();
    assert_eq!((x.n_rows, x.n_cols), (10, 3));
    assert!(x.location.ends_with("X/X.parquet"));

    let normalized = store.open_layer("RNA", "normalized").await.unwrap();
    assert!(normalized.location.ends_with("normalized/data.parquet"));

    let counts = store.open_layer("RNA", "counts").await.unwrap();
    assert!(counts.location.ends_with("counts/b.parquet"));

    let noshape = store.open_layer("RNA", "noshape").await.unwrap();
    assert_eq!((noshape.n_rows, noshape.n_cols), (10, 3));
}

#[tokio::test]
async fn test_missing_layer_lists_available() {
    let store = open_standard_experiment("pq-nolayer").await;
    let err = store.open_layer("RNA", "raw").await.unwrap_err();
    match err {
        StoreError::LayerNotFound { measurement, layer, available } => {
            assert_eq!(measurement, "RNA");
            assert_eq!(layer, "raw");
            assert_eq!(available, vec!["X", "counts", "normalized", "noshape"]);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_bad_shape_metadata_is_malformed() {
    let uri = unique_uri("pq-badshape");
    write_experiment(&uri, 4, 2).await;
    let bytes = parquet_bytes(&layer_batch(4, 2, 1.0), 8, &[("soma_shape", "four,two".to_string())]);
    register_memory_file(&format!("{}/ms/RNA/X/bad.parquet", uri), bytes).await.unwrap();

    let store = ParquetExperiment::open(&uri).await.unwrap();
    let err = store.open_layer("RNA", "bad").await.unwrap_err();
    assert!(matches!(err, StoreError::Malformed(_)), "{:?}", err);
}

#[tokio::test]
async fn test_read_matrix_rows_returns_only_the_range() {
    let store = open_standard_experiment("pq-rows").await;
    let layer = store.open_layer("RNA", "X").await.unwrap();

    let block = store.read_matrix_rows(&layer, 2..5).await.unwrap();
    assert_eq!(block.n_cols, 3);
    assert!(block.row_ids.iter().all(|r| (2..5).contains(r)));
    // Two stored values per row
    assert_eq!(block.nnz(), 6);
    for i in 0..block.nnz() {
        assert_eq!(block.values[i], expected_value(block.row_ids[i], block.col_ids[i]));
    }

    let empty = store.read_matrix_rows(&layer, 5..5).await.unwrap();
    assert_eq!(empty.nnz(), 0);
    let beyond = store.read_matrix_rows(&layer, 50..60).await.unwrap();
    assert_eq!(beyond.nnz(), 0);
}

#[test]
fn test_row_group_pruning_uses_dim_0_statistics() {
    // Two entries per row and four entries per row group: group k holds rows 2k and 2k+1
    let bytes = parquet_bytes(&layer_batch(10, 3, 1.0), 4, &[]);
    let reader = SerializedFileReader::new(bytes).unwrap();
    let metadata = reader.metadata();
    assert_eq!(metadata.num_row_groups(), 5);

    assert_eq!(overlapping_row_groups(metadata, &(9..10)), vec![4]);
    assert_eq!(overlapping_row_groups(metadata, &(2..5)), vec![1, 2]);
    assert_eq!(overlapping_row_groups(metadata, &(0..10)), vec![0, 1, 2, 3, 4]);
    assert!(overlapping_row_groups(metadata, &(20..30)).is_empty());
}

#[tokio::test]
async fn test_read_var() {
    let store = open_standard_experiment("pq-var").await;
    let var = store.read_var("RNA").await.unwrap();
    assert_eq!(var.num_rows(), 3);
    assert!(var.column_by_name("gene_name").is_some());

    let err = store.read_var("ATAC").await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)), "{:?}", err);
}
