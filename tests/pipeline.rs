// 该文件是 Xuanjian （选鉴） 项目的一部分。
// tests/pipeline.rs - 处理流程集成测试
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::{
  io::Cursor,
  path::Path,
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
  thread,
  time::Duration,
};

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use url::Url;

use xuanjian::{
  FeatureExtractor, Pipeline, PipelineError,
  config::Settings,
  frame::{RgbNchwTensor, decode, decode_rgb},
  input::Request,
  model::{
    DetectionRunner, Detector, DetectorLoader, InferenceError, ModelEntry, ModelRegistry,
    RawDetections, RegistryError,
  },
  output::draw::RenderError,
  pipeline::StartupError,
  selector::{Classifier, FeatureRow, ModelSelector, SelectionError},
};

const LIME: Rgb<u8> = Rgb([0, 255, 0]);

struct StubClassifier {
  answer: String,
  classes: Vec<String>,
  calls: Arc<AtomicUsize>,
}

impl Classifier for StubClassifier {
  fn predict(&self, row: &FeatureRow) -> Result<String, SelectionError> {
    assert_eq!(row.columns().len(), 4);
    self.calls.fetch_add(1, Ordering::SeqCst);
    Ok(self.answer.clone())
  }

  fn classes(&self) -> &[String] {
    &self.classes
  }
}

struct StubDetector {
  raw: RawDetections,
  delay: Duration,
  calls: Arc<AtomicUsize>,
}

impl Detector for StubDetector {
  fn infer(&self, _: &RgbNchwTensor) -> Result<RawDetections, InferenceError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    thread::sleep(self.delay);
    Ok(self.raw.clone())
  }
}

struct Harness {
  classifier_calls: Arc<AtomicUsize>,
  detector_calls: Arc<AtomicUsize>,
  pipeline: Pipeline,
}

fn one_box(label: i64, score: f32) -> RawDetections {
  RawDetections {
    boxes: vec![[10.0, 10.0, 50.0, 50.0]],
    labels: vec![label],
    scores: vec![score],
  }
}

fn harness(answer: &str, raw: RawDetections, delay: Duration) -> Harness {
  let classifier_calls = Arc::new(AtomicUsize::new(0));
  let detector_calls = Arc::new(AtomicUsize::new(0));

  let registry = ModelRegistry::from_entries([
    ModelEntry {
      key: "frcnn".to_string(),
      name: "Faster R-CNN".to_string(),
      categories: vec!["person".to_string(), "cat".to_string()].into_boxed_slice(),
      detector: Arc::new(StubDetector {
        raw,
        delay,
        calls: Arc::clone(&detector_calls),
      }),
    },
    ModelEntry {
      key: "ssd".to_string(),
      name: "SSDlite".to_string(),
      categories: vec!["person".to_string()].into_boxed_slice(),
      detector: Arc::new(StubDetector {
        raw: RawDetections::default(),
        delay: Duration::ZERO,
        calls: Arc::new(AtomicUsize::new(0)),
      }),
    },
  ]);
  let selector = ModelSelector::new(StubClassifier {
    answer: answer.to_string(),
    classes: vec![answer.to_string()],
    calls: Arc::clone(&classifier_calls),
  });

  Harness {
    classifier_calls,
    detector_calls,
    pipeline: Pipeline::new(selector, registry),
  }
}

fn encode(image: &RgbImage, format: ImageFormat) -> Vec<u8> {
  let mut bytes = Vec::new();
  image.write_to(&mut Cursor::new(&mut bytes), format).unwrap();
  bytes
}

#[test]
fn annotates_with_the_selected_model() {
  let h = harness("frcnn", one_box(0, 0.9), Duration::ZERO);
  let image = RgbImage::from_pixel(100, 100, Rgb([90, 90, 90]));

  let annotation = h
    .pipeline
    .process_image(&DynamicImage::ImageRgb8(image.clone()))
    .unwrap();
  assert_eq!(annotation.entry.key, "frcnn");
  assert_eq!(annotation.caption(), "Model used: Faster R-CNN");
  assert_eq!(annotation.detections, 1);
  assert_eq!(annotation.image.dimensions(), (100, 100));
  assert_eq!(*annotation.image.get_pixel(10, 30), LIME);
  assert_eq!(*annotation.image.get_pixel(50, 30), LIME);
  assert_eq!(*annotation.image.get_pixel(30, 30), Rgb([90, 90, 90]));
  assert_eq!(annotation.fingerprint.ratio_hw, 1.0);
  assert_eq!(annotation.fingerprint.num_objects_mod, 1);
}

#[test]
fn process_returns_jpeg_reply() {
  let h = harness("frcnn", one_box(1, 0.9), Duration::ZERO);
  let bytes = encode(&RgbImage::from_pixel(80, 60, Rgb([255, 255, 255])), ImageFormat::Png);

  let reply = h.pipeline.process(&Request::new("req-1", bytes)).unwrap();
  assert_eq!(reply.request_id, "req-1");
  assert_eq!(reply.model_key, "frcnn");
  assert_eq!(reply.caption, "Model used: Faster R-CNN");
  assert_eq!(&reply.image[..2], &[0xff, 0xd8]);

  let decoded = decode_rgb(&reply.image).unwrap();
  assert_eq!(decoded.dimensions(), (80, 60));
  assert_eq!(h.classifier_calls.load(Ordering::SeqCst), 1);
  assert_eq!(h.detector_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn unknown_model_is_a_fatal_configuration_mismatch() {
  let h = harness("retinanet", one_box(0, 0.9), Duration::ZERO);
  let bytes = encode(&RgbImage::from_pixel(20, 20, Rgb([1, 2, 3])), ImageFormat::Png);

  let err = h.pipeline.process(&Request::new("r", bytes)).unwrap_err();
  assert!(matches!(
    err,
    PipelineError::Selection(SelectionError::UnknownModel { ref name, .. }) if name == "retinanet"
  ));
  assert!(err.is_fatal());
  assert_eq!(h.detector_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn corrupt_bytes_stop_before_selection() {
  let h = harness("frcnn", one_box(0, 0.9), Duration::ZERO);

  let err = h
    .pipeline
    .process(&Request::new("r", b"\x89PNG but not really".to_vec()))
    .unwrap_err();
  assert!(matches!(err, PipelineError::Decode(_)));
  assert!(!err.is_fatal());
  assert_eq!(h.classifier_calls.load(Ordering::SeqCst), 0);
  assert_eq!(h.detector_calls.load(Ordering::SeqCst), 0);

  let empty = h.pipeline.process(&Request::new("r", Vec::new())).unwrap_err();
  assert!(matches!(empty, PipelineError::Decode(_)));
}

#[test]
fn out_of_range_label_is_a_render_error() {
  let h = harness("frcnn", one_box(7, 0.9), Duration::ZERO);
  let bytes = encode(&RgbImage::from_pixel(64, 64, Rgb([5, 5, 5])), ImageFormat::Png);

  let err = h.pipeline.process(&Request::new("r", bytes)).unwrap_err();
  assert!(matches!(
    err,
    PipelineError::Render(RenderError::LabelOutOfRange { label: 7, len: 2 })
  ));
  assert!(!err.is_fatal());
}

#[test]
fn slow_detector_times_out() {
  let h = harness("frcnn", one_box(0, 0.9), Duration::from_millis(500));
  let pipeline = h
    .pipeline
    .with_runner(DetectionRunner::new().with_timeout(Some(Duration::from_millis(20))));
  let bytes = encode(&RgbImage::from_pixel(16, 16, Rgb([5, 5, 5])), ImageFormat::Png);

  let err = pipeline.process(&Request::new("r", bytes)).unwrap_err();
  assert!(matches!(err, PipelineError::Inference(InferenceError::Timeout(_))));
}

#[test]
fn grayscale_input_is_fingerprinted_as_rgb() {
  let h = harness("frcnn", RawDetections::default(), Duration::ZERO);
  let gray = image::GrayImage::from_pixel(20, 10, image::Luma([51]));
  let mut bytes = Vec::new();
  gray
    .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
    .unwrap();

  let decoded = decode(&bytes).unwrap();
  assert!(matches!(decoded, DynamicImage::ImageLuma8(_)));
  let annotation = h.pipeline.process_image(&decoded).unwrap();

  let expected =
    FeatureExtractor::default().extract(&DynamicImage::ImageRgb8(decode_rgb(&bytes).unwrap()));
  assert_eq!(annotation.fingerprint, expected);
  assert_eq!(annotation.image.dimensions(), (20, 10));
}

const TREE: &str = r#"{
  "feature_names": ["num_objects", "mean_box_area", "num_categories", "ratio_hw"],
  "classes": ["frcnn", "ssd"],
  "nodes": [
    {"feature": 3, "threshold": 1.5, "left": 1, "right": 2},
    {"value": [3.0, 1.0]},
    {"value": [0.0, 4.0]}
  ]
}"#;

struct StubLoader {
  loads: AtomicUsize,
}

impl DetectorLoader for StubLoader {
  fn load(&self, location: &Url) -> Result<Arc<dyn Detector>, RegistryError> {
    assert_eq!(location.scheme(), "onnx");
    self.loads.fetch_add(1, Ordering::SeqCst);
    Ok(Arc::new(StubDetector {
      raw: RawDetections::default(),
      delay: Duration::ZERO,
      calls: Arc::new(AtomicUsize::new(0)),
    }))
  }
}

fn settings(dir: &Path, models: &str) -> Settings {
  let tree = dir.join("selector.json");
  std::fs::write(&tree, TREE).unwrap();
  let json = format!(
    r#"{{
      "selector": "tree://{}",
      "threshold": 0.4,
      "inference_timeout_ms": 0,
      "font": "{}",
      "models": {}
    }}"#,
    tree.display(),
    dir.join("missing.ttf").display(),
    models
  );
  Settings::from_json(&json).unwrap()
}

#[test]
fn startup_builds_pipeline_from_settings() {
  let dir = tempfile::tempdir().unwrap();
  let labels = dir.path().join("labels.txt");
  std::fs::write(&labels, "__background__\nperson\n\ncat\n").unwrap();
  let models = format!(
    r#"{{
      "frcnn": {{"name": "Faster R-CNN", "model": "onnx:///m/frcnn.onnx", "categories": ["bg", "person"]}},
      "ssd": {{"name": "SSDlite", "model": "onnx:///m/ssd.onnx", "categories": "{}"}}
    }}"#,
    labels.display()
  );
  let settings = settings(dir.path(), &models);
  let loader = StubLoader {
    loads: AtomicUsize::new(0),
  };

  let pipeline = Pipeline::from_settings_with_loader(&settings, &loader).unwrap();
  assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
  assert_eq!(pipeline.registry().len(), 2);
  let ssd = pipeline.registry().get("ssd").unwrap();
  assert_eq!(&*ssd.categories, &["__background__", "person", "cat"]);

  // 高宽比 2.0 > 1.5，决策树选择 ssd
  let tall = encode(&RgbImage::from_pixel(20, 40, Rgb([10, 200, 10])), ImageFormat::Png);
  let reply = pipeline.process(&Request::new("tall", tall)).unwrap();
  assert_eq!(reply.model_key, "ssd");
  assert_eq!(reply.caption, "Model used: SSDlite");

  let wide = encode(&RgbImage::from_pixel(40, 20, Rgb([10, 200, 10])), ImageFormat::Png);
  let reply = pipeline.process(&Request::new("wide", wide)).unwrap();
  assert_eq!(reply.model_key, "frcnn");
}

#[test]
fn startup_rejects_selector_classes_missing_from_registry() {
  let dir = tempfile::tempdir().unwrap();
  let models = r#"{
    "frcnn": {"name": "Faster R-CNN", "model": "onnx:///m/frcnn.onnx", "categories": ["bg"]}
  }"#;
  let settings = settings(dir.path(), models);
  let loader = StubLoader {
    loads: AtomicUsize::new(0),
  };

  let result = Pipeline::from_settings_with_loader(&settings, &loader);
  assert!(matches!(
    result,
    Err(StartupError::Selection(SelectionError::UnknownModel { ref name, .. })) if name == "ssd"
  ));
}

#[test]
fn startup_fails_on_unreadable_categories() {
  let dir = tempfile::tempdir().unwrap();
  let models = format!(
    r#"{{
      "frcnn": {{"name": "Faster R-CNN", "model": "onnx:///m/frcnn.onnx", "categories": "{}"}},
      "ssd": {{"name": "SSDlite", "model": "onnx:///m/ssd.onnx", "categories": ["bg"]}}
    }}"#,
    dir.path().join("nope.txt").display()
  );
  let settings = settings(dir.path(), &models);
  let loader = StubLoader {
    loads: AtomicUsize::new(0),
  };

  let result = Pipeline::from_settings_with_loader(&settings, &loader);
  assert!(matches!(
    result,
    Err(StartupError::Registry(RegistryError::Categories { ref key, .. })) if key == "frcnn"
  ));
}
