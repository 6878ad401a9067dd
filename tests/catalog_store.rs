use std::path::Path;

use image::{Rgb, RgbImage};
use tempfile::tempdir;

use reel_match::{
    build_catalog, load_index_set, CatalogStore, Embedder, Frame, HistogramEmbedder,
    SqliteCatalogStore,
};

fn write_png(dir: &Path, name: &str, image: &RgbImage) {
    image.save(dir.join(name)).expect("write png");
}

fn product_images(dir: &Path) {
    write_png(dir, "red-dress.png", &RgbImage::from_pixel(32, 48, Rgb([200, 20, 20])));
    write_png(dir, "blue-shirt.png", &RgbImage::from_pixel(32, 48, Rgb([20, 40, 200])));
    write_png(
        dir,
        "striped-top.png",
        &RgbImage::from_fn(32, 48, |_, y| {
            if (y / 4) % 2 == 0 {
                Rgb([240, 240, 240])
            } else {
                Rgb([10, 10, 10])
            }
        }),
    );
    std::fs::write(dir.join("README.txt"), "not an image").expect("write txt");
    std::fs::write(dir.join("broken.png"), b"\x89PNG garbage").expect("write broken");
}

#[test]
fn built_catalog_round_trips_through_sqlite_and_self_matches() {
    let images = tempdir().unwrap();
    product_images(images.path());
    let db_dir = tempdir().unwrap();
    let db_path = db_dir.path().join("catalog.db");
    let embedder = HistogramEmbedder::default();

    let entries = build_catalog(images.path(), "clothing", &embedder).unwrap();
    let ids: Vec<&str> = entries.iter().map(|e| e.product_id.as_str()).collect();
    assert_eq!(ids, vec!["blue-shirt", "red-dress", "striped-top"]);

    {
        let mut store = SqliteCatalogStore::open(&db_path).unwrap();
        assert_eq!(store.save_entries(embedder.model_id(), &entries).unwrap(), 3);
    }

    let mut store = SqliteCatalogStore::open(&db_path).unwrap();
    let meta = store.meta().unwrap().expect("meta after save");
    assert_eq!(meta.dimension, embedder.dimension());
    assert_eq!(meta.model_id, embedder.model_id());

    let indexes = load_index_set(&mut store, &embedder).unwrap();
    assert_eq!(indexes.categories(), vec!["clothing".to_string()]);
    assert_eq!(indexes.total_products(), 3);

    let red = Frame::new(RgbImage::from_pixel(10, 10, Rgb([200, 20, 20])), 0.0);
    let query = embedder.embed(&red).unwrap();
    let first = indexes.query("clothing", &query, 5).unwrap();
    assert_eq!(first.len(), 3);
    assert_eq!(first[0].product_id, "red-dress");
    assert!((first[0].score - 1.0).abs() < 1e-4);
    assert!(first.windows(2).all(|w| w[0].score >= w[1].score));

    let again = indexes.query("clothing", &query, 5).unwrap();
    assert_eq!(first, again);
    assert!(indexes.query("shoes", &query, 5).unwrap().is_empty());
}

#[test]
fn second_category_extends_the_catalog() {
    let db_dir = tempdir().unwrap();
    let db_path = db_dir.path().join("catalog.db");
    let embedder = HistogramEmbedder::default();

    let tops = tempdir().unwrap();
    product_images(tops.path());
    let rings = tempdir().unwrap();
    write_png(rings.path(), "gold.png", &RgbImage::from_pixel(16, 16, Rgb([212, 175, 55])));

    let mut store = SqliteCatalogStore::open(&db_path).unwrap();
    let tops = build_catalog(tops.path(), "clothing", &embedder).unwrap();
    store.save_entries(embedder.model_id(), &tops).unwrap();
    let rings = build_catalog(rings.path(), "jewelry", &embedder).unwrap();
    store.save_entries(embedder.model_id(), &rings).unwrap();

    assert!(store.save_entries(embedder.model_id(), &rings).is_err(), "duplicate ids");

    let indexes = load_index_set(&mut store, &embedder).unwrap();
    assert_eq!(
        indexes.categories(),
        vec!["clothing".to_string(), "jewelry".to_string()]
    );
    assert_eq!(indexes.total_products(), 4);
}

#[test]
fn catalog_from_another_dimension_is_rejected() {
    let images = tempdir().unwrap();
    product_images(images.path());
    let small = HistogramEmbedder::new(1, 4).unwrap();
    let entries = build_catalog(images.path(), "clothing", &small).unwrap();

    let mut store = SqliteCatalogStore::open_in_memory().unwrap();
    store.save_entries(small.model_id(), &entries).unwrap();
    assert!(load_index_set(&mut store, &HistogramEmbedder::default()).is_err());
}

#[test]
fn empty_store_loads_an_empty_index_set() {
    let mut store = SqliteCatalogStore::open_in_memory().unwrap();
    let indexes = load_index_set(&mut store, &HistogramEmbedder::default()).unwrap();
    assert_eq!(indexes.total_products(), 0);
}
