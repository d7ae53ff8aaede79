mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::GenericImageView;

use common::{png_bytes, scratch_dir, InMemoryStore, ScriptedModel};
use pollinator_pipeline::clients::{collect_object_paths, enumerate_prefixes, ObjectStore};
use pollinator_pipeline::models::{
    BoundingBox, FlowerRow, ImageRecord, PersistedFlower, PipelineError,
};
use pollinator_pipeline::processing::{
    crop_with_margin, BatchItem, CoordinateResolver, Detection, InferencePipeline,
};

fn record(file_id: i64, object_name: &str) -> ImageRecord {
    ImageRecord {
        file_id,
        object_name: object_name.to_string(),
    }
}

type Script = Box<
    dyn FnMut(&image::DynamicImage) -> pollinator_pipeline::models::Result<Vec<Detection>> + Send,
>;

/// Flower stage finds one box in the 100x100 source image.
fn flower_model() -> ScriptedModel<Script> {
    ScriptedModel::new(Box::new(|image: &image::DynamicImage| {
        if image.dimensions() != (100, 100) {
            return Ok(Vec::new());
        }
        let bbox = BoundingBox::new(10.0, 10.0, 50.0, 50.0);
        Ok(vec![Detection {
            bbox,
            class_id: 0,
            class_name: "daisy".to_string(),
            score: 0.9,
            crop: crop_with_margin(image, &bbox, 5),
        }])
    }))
}

/// Pollinator stage finds one box in the 50x50 crop it gets handed.
fn pollinator_model() -> ScriptedModel<Script> {
    ScriptedModel::new(Box::new(|image: &image::DynamicImage| {
        if image.dimensions() != (50, 50) {
            return Ok(Vec::new());
        }
        let bbox = BoundingBox::new(2.0, 2.0, 8.0, 8.0);
        Ok(vec![Detection {
            bbox,
            class_id: 0,
            class_name: "honigbiene".to_string(),
            score: 0.8,
            crop: crop_with_margin(image, &bbox, 0),
        }])
    }))
}

#[test]
fn test_two_stage_cascade_with_one_broken_image() {
    let dir = scratch_dir();
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("a.png"), png_bytes(100, 100)).unwrap();
    std::fs::write(dir.join("b.png"), b"not an image").unwrap();

    let items = vec![
        BatchItem {
            record: record(1, "plots/a.png"),
            path: dir.join("a.png"),
        },
        BatchItem {
            record: record(2, "plots/b.png"),
            path: dir.join("b.png"),
        },
    ];

    let mut flower = flower_model();
    let mut pollinator = pollinator_model();

    let pipeline = InferencePipeline::new(Arc::new(AtomicBool::new(false)));
    let output = pipeline.run(&items, &mut flower, &mut pollinator);

    // Image B fails to load and contributes nothing; the batch survives.
    assert_eq!(output.processed, 1);
    assert_eq!(output.skipped.len(), 1);
    assert!(matches!(
        &output.skipped[0],
        PipelineError::InferenceItem { object, .. } if object == "plots/b.png"
    ));
    assert_eq!(pipeline.progress().load(Ordering::Relaxed), 2);

    assert_eq!(output.flower_drafts.len(), 1);
    let flower_draft = &output.flower_drafts[0];
    assert_eq!(flower_draft.object_name, "plots/a.png");
    assert_eq!(flower_draft.flower_box_id, 0);
    // The crop was expanded by the margin on every side.
    assert_eq!((flower_draft.width, flower_draft.height), (50, 50));

    assert_eq!(output.pollinator_drafts.len(), 1);
    let pollinator_draft = &output.pollinator_drafts[0];
    assert_eq!(pollinator_draft.bbox, BoundingBox::new(2.0, 2.0, 8.0, 8.0));

    // Loader would assign result_id 100 / flower_id 500; resolution then maps
    // the crop-local box back into the image frame.
    let flower_row = FlowerRow::from_draft(flower_draft, 100);
    assert_eq!(
        (flower_row.x0, flower_row.y0, flower_row.x1, flower_row.y1),
        (10, 10, 50, 50)
    );

    let persisted = PersistedFlower {
        flower_id: 500,
        result_id: 100,
        object_name: flower_draft.object_name.clone(),
        flower_box_id: flower_draft.flower_box_id,
        x0: flower_row.x0,
        y0: flower_row.y0,
    };
    let resolved = CoordinateResolver::new(5).resolve(&[persisted], &output.pollinator_drafts);
    assert!(resolved.dropped_images.is_empty());
    assert_eq!(resolved.rows.len(), 1);
    let row = &resolved.rows[0];
    assert_eq!((row.x0, row.y0, row.x1, row.y1), (7, 7, 13, 13));
    assert_eq!(row.flower_id, 500);
    assert_eq!(row.result_id, 100);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_cancellation_stops_before_first_image() {
    let dir = scratch_dir();
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("a.png"), png_bytes(100, 100)).unwrap();

    let items = vec![BatchItem {
        record: record(1, "plots/a.png"),
        path: dir.join("a.png"),
    }];

    let mut flower = flower_model();
    let mut pollinator = pollinator_model();

    let cancel = Arc::new(AtomicBool::new(true));
    let pipeline = InferencePipeline::new(cancel);
    let output = pipeline.run(&items, &mut flower, &mut pollinator);

    assert_eq!(output.processed, 0);
    assert!(output.flower_drafts.is_empty());
    assert!(output.pollinator_drafts.is_empty());

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_prefix_enumeration_and_suffix_filter() {
    let mut objects = HashMap::new();
    objects.insert("plot-1/2023/a.jpg".to_string(), vec![1u8]);
    objects.insert("plot-1/2023/b.png".to_string(), vec![2u8]);
    objects.insert("plot-1/2023/notes.txt".to_string(), vec![3u8]);
    objects.insert("plot-2/c.jpg".to_string(), vec![4u8]);
    let store = InMemoryStore::new(objects);

    let paths = collect_object_paths(
        &store,
        "bucket",
        &["plot-1/".to_string()],
        &[".jpg".to_string(), ".png".to_string()],
    )
    .await
    .unwrap();
    assert_eq!(
        paths,
        vec!["plot-1/2023/a.jpg".to_string(), "plot-1/2023/b.png".to_string()]
    );

    // The flat fake store has no folder entries, so expansion stops after the
    // root level.
    let levels = enumerate_prefixes(&store, "bucket", 3).await.unwrap();
    assert_eq!(levels.len(), 1);
    assert_eq!(levels[0].len(), 4);
}

#[tokio::test]
async fn test_in_memory_store_round_trip() {
    let store = InMemoryStore::new(HashMap::new());
    let dir = scratch_dir();
    std::fs::create_dir_all(&dir).unwrap();
    let src = dir.join("upload.png");
    std::fs::write(&src, png_bytes(4, 4)).unwrap();

    store.put("bucket", "x/upload.png", &src).await.unwrap();
    assert!(store.contains("x/upload.png"));

    let dest = dir.join("download.png");
    store.get("bucket", "x/upload.png", &dest).await.unwrap();
    assert_eq!(
        std::fs::read(&src).unwrap(),
        std::fs::read(&dest).unwrap()
    );

    let _ = std::fs::remove_dir_all(&dir);
}
