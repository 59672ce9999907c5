// 该文件是 Xuanjian （选鉴） 项目的一部分。
// src/task.rs - 请求处理循环
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
  sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
    mpsc,
  },
  thread,
  time::{Duration, Instant},
};

use anyhow::Context;
use tracing::{error, info, warn};

use crate::{
  input::Request,
  output::Render,
  pipeline::{Pipeline, PipelineError, Reply},
};

pub trait Task<I, P, O>: Sized {
  type Error;
  fn run_task(self, input: I, pipeline: P, output: O) -> Result<(), Self::Error>;
}

/// 处理一次请求并投递结果或失败提示。
/// `Ok(Some(_))` 表示请求失败但服务可以继续，`Err` 表示应停止服务。
fn serve<O, RE>(
  request: &Request,
  pipeline: &Pipeline,
  output: &O,
) -> anyhow::Result<Option<PipelineError>>
where
  O: Render<Request, Reply, Error = RE>,
  RE: std::error::Error + Send + Sync + 'static,
{
  match pipeline.process(request) {
    Ok(reply) => {
      output.render_result(request, &reply)?;
      Ok(None)
    }
    Err(e) => {
      output.render_failure(request, e.user_message())?;
      if e.is_fatal() {
        error!("请求 {} 遇到配置错误，停止服务: {}", request.id, e);
        return Err(e.into());
      }
      Ok(Some(e))
    }
  }
}

pub struct OneShotTask;

impl<'p, I, O, RE> Task<I, &'p Pipeline, O> for OneShotTask
where
  I: Iterator<Item = Request>,
  O: Render<Request, Reply, Error = RE>,
  RE: std::error::Error + Send + Sync + 'static,
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, pipeline: &'p Pipeline, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let request = input.next().ok_or_else(|| anyhow::anyhow!("没有输入请求"))?;
    let now = Instant::now();
    if let Some(e) = serve(&request, pipeline, &output)? {
      return Err(anyhow::Error::new(e).context(format!("请求 {} 处理失败", request.id)));
    }
    info!("处理完成，耗时: {:.2?}", now.elapsed());
    Ok(())
  }
}

/// 多个工作线程共享同一个处理流程，从通道中取请求
#[derive(Debug)]
pub struct ContinuousTask {
  frame_number: Option<usize>,
  workers: usize,
  stop: Arc<AtomicBool>,
}

impl Default for ContinuousTask {
  fn default() -> Self {
    Self {
      frame_number: None,
      workers: 1,
      stop: Arc::new(AtomicBool::new(false)),
    }
  }
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_workers(mut self, workers: usize) -> Self {
    self.workers = workers.max(1);
    self
  }

  /// 停止标志：置位后不再分发新请求，已在处理的请求照常完成
  pub fn stop_flag(&self) -> Arc<AtomicBool> {
    Arc::clone(&self.stop)
  }

  /// 安装 Ctrl-C 处理函数，每个进程只能调用一次
  pub fn handle_ctrlc(self) -> anyhow::Result<Self> {
    let stop = self.stop_flag();
    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      stop.store(true, Ordering::SeqCst);
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })
    .context("无法设置 Ctrl-C 处理函数")?;
    Ok(self)
  }
}

impl<'p, I, O, RE> Task<I, &'p Pipeline, O> for ContinuousTask
where
  I: Iterator<Item = Request>,
  O: Render<Request, Reply, Error = RE> + Sync,
  RE: std::error::Error + Send + Sync + 'static,
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, pipeline: &'p Pipeline, output: O) -> Result<(), Self::Error> {
    info!("开始任务，工作线程数: {}", self.workers);
    let replied = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let fatal: Mutex<Option<anyhow::Error>> = Mutex::new(None);
    let halted = AtomicBool::new(false);
    let now = Instant::now();

    let (tx, rx) = mpsc::sync_channel::<Request>(self.workers);
    let rx = Mutex::new(rx);

    thread::scope(|s| {
      for worker in 0..self.workers {
        let (rx, output, halted) = (&rx, &output, &halted);
        let (replied, failed, fatal) = (&replied, &failed, &fatal);
        s.spawn(move || {
          loop {
            let request = match rx.lock() {
              Ok(rx) => rx.recv(),
              Err(_) => break,
            };
            let Ok(request) = request else { break };
            // 停止服务后继续清空通道，避免分发端阻塞
            if halted.load(Ordering::SeqCst) {
              continue;
            }

            match serve(&request, pipeline, output) {
              Ok(None) => {
                replied.fetch_add(1, Ordering::Relaxed);
              }
              Ok(Some(_)) => {
                failed.fetch_add(1, Ordering::Relaxed);
              }
              Err(e) => {
                error!("工作线程 {} 停止服务: {:#}", worker, e);
                halted.store(true, Ordering::SeqCst);
                if let Ok(mut slot) = fatal.lock() {
                  slot.get_or_insert(e);
                }
              }
            }
          }
        });
      }

      let mut frame_index = 0;
      for request in input {
        if halted.load(Ordering::SeqCst) {
          break;
        }
        if self.stop.load(Ordering::SeqCst) {
          warn!("收到停止信号，不再分发请求");
          break;
        }
        frame_index += 1;
        info!("分发第 {} 个请求: {}", frame_index, request.id);
        if tx.send(request).is_err() {
          break;
        }
        if self.frame_number.map(|n| frame_index >= n).unwrap_or(false) {
          info!("达到指定请求数 {}, 退出任务循环", frame_index);
          break;
        }
      }
      drop(tx);
    });

    info!(
      "任务完成: 成功 {}, 失败 {}, 耗时 {:.2?}",
      replied.load(Ordering::Relaxed),
      failed.load(Ordering::Relaxed),
      now.elapsed()
    );

    match fatal.into_inner() {
      Ok(Some(e)) => Err(e),
      Ok(None) => Ok(()),
      Err(_) => Err(anyhow::anyhow!("工作线程异常退出")),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::io::Cursor;

  use image::{ImageFormat, Rgb, RgbImage};

  use super::*;
  use crate::{
    frame::RgbNchwTensor,
    model::{Detector, InferenceError, ModelEntry, ModelRegistry, RawDetections},
    selector::{Classifier, FeatureRow, ModelSelector, SelectionError},
  };

  struct Always(Vec<String>);

  impl Classifier for Always {
    fn predict(&self, _: &FeatureRow) -> Result<String, SelectionError> {
      Ok(self.0[0].clone())
    }

    fn classes(&self) -> &[String] {
      &self.0
    }
  }

  struct NoBoxes;

  impl Detector for NoBoxes {
    fn infer(&self, _: &RgbNchwTensor) -> Result<RawDetections, InferenceError> {
      Ok(RawDetections::default())
    }
  }

  #[derive(Default)]
  struct Collect {
    replies: Mutex<Vec<String>>,
    failures: Mutex<Vec<String>>,
  }

  impl Render<Request, Reply> for &Collect {
    type Error = std::io::Error;

    fn render_result(&self, _: &Request, result: &Reply) -> Result<(), Self::Error> {
      self.replies.lock().unwrap().push(result.request_id.clone());
      Ok(())
    }

    fn render_failure(&self, frame: &Request, _: &str) -> Result<(), Self::Error> {
      self.failures.lock().unwrap().push(frame.id.clone());
      Ok(())
    }
  }

  fn pipeline(class: &str) -> Pipeline {
    let registry = ModelRegistry::from_entries([ModelEntry {
      key: "ssd".to_string(),
      name: "SSD".to_string(),
      categories: vec!["bg".to_string()].into_boxed_slice(),
      detector: Arc::new(NoBoxes),
    }]);
    Pipeline::new(ModelSelector::new(Always(vec![class.to_string()])), registry)
  }

  fn png() -> Vec<u8> {
    let mut bytes = Vec::new();
    RgbImage::from_pixel(16, 12, Rgb([200, 10, 10]))
      .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
      .unwrap();
    bytes
  }

  fn requests(n: usize) -> Vec<Request> {
    (0..n)
      .map(|i| Request::new(format!("{:02}", i), png()))
      .collect()
  }

  #[test]
  fn one_shot_replies_once() {
    let output = Collect::default();
    OneShotTask
      .run_task(requests(3).into_iter(), &pipeline("ssd"), &output)
      .unwrap();
    assert_eq!(*output.replies.lock().unwrap(), vec!["00".to_string()]);
  }

  #[test]
  fn one_shot_reports_failure() {
    let output = Collect::default();
    let bad = vec![Request::new("bad", b"not an image".to_vec())];
    assert!(
      OneShotTask
        .run_task(bad.into_iter(), &pipeline("ssd"), &output)
        .is_err()
    );
    assert_eq!(*output.failures.lock().unwrap(), vec!["bad".to_string()]);
    assert!(output.replies.lock().unwrap().is_empty());
  }

  #[test]
  fn continuous_handles_every_request_with_workers() {
    let output = Collect::default();
    let mut input = requests(6);
    input.insert(2, Request::new("corrupt", vec![0, 1, 2]));

    ContinuousTask::default()
      .with_workers(3)
      .run_task(input.into_iter(), &pipeline("ssd"), &output)
      .unwrap();

    let mut replies = output.replies.lock().unwrap().clone();
    replies.sort();
    assert_eq!(replies, vec!["00", "01", "02", "03", "04", "05"]);
    assert_eq!(*output.failures.lock().unwrap(), vec!["corrupt".to_string()]);
  }

  #[test]
  fn continuous_respects_frame_number() {
    let output = Collect::default();
    ContinuousTask::default()
      .with_frame_number(Some(2))
      .run_task(requests(5).into_iter(), &pipeline("ssd"), &output)
      .unwrap();
    assert_eq!(output.replies.lock().unwrap().len(), 2);
  }

  #[test]
  fn continuous_stops_on_configuration_mismatch() {
    let output = Collect::default();
    let result = ContinuousTask::default().with_workers(1).run_task(
      requests(50).into_iter(),
      &pipeline("ghost"),
      &output,
    );
    assert!(result.is_err());
    assert!(output.replies.lock().unwrap().is_empty());
    assert!(output.failures.lock().unwrap().len() < 50);
  }

  #[test]
  fn stop_flag_prevents_dispatch() {
    let output = Collect::default();
    let task = ContinuousTask::default();
    task.stop_flag().store(true, Ordering::SeqCst);
    task
      .run_task(requests(3).into_iter(), &pipeline("ssd"), &output)
      .unwrap();
    assert!(output.replies.lock().unwrap().is_empty());
  }
}
