use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use crossbeam_utils::sync::WaitGroup;
use thiserror::Error;

use oxy_gfx::resources::TextureFormat;

use crate::handle::{AssetHandle, AssetKind};
use crate::pak::PakArchive;

/// 烘焙纹理的头：width u32、height u32、format u32（小端）
pub const TEXTURE_BLOB_HEADER: usize = 12;

/// 资产数据的来源
#[derive(Clone)]
pub enum AssetSource {
    /// 已经在内存里的烘焙数据
    Bytes(Arc<[u8]>),
    Pak { archive: Arc<PakArchive>, key: u64 },
    /// 松散的烘焙文件
    File(PathBuf),
}

impl std::fmt::Debug for AssetSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssetSource::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            AssetSource::Pak { archive, key } => write!(f, "Pak({}:{:016x})", archive.source_id(), key),
            AssetSource::File(path) => write!(f, "File({:?})", path),
        }
    }
}

pub struct AssetLoadRequest {
    pub handle: AssetHandle,
    pub label: String,
    pub kind: AssetKind,
    pub source: AssetSource,
}

/// 烘焙后的 CPU 端数据，准备上传到 GPU
#[derive(Debug, PartialEq, Eq)]
pub enum CookedAsset {
    Buffer {
        bytes: Vec<u8>,
    },
    Texture {
        width: u32,
        height: u32,
        format: TextureFormat,
        pixels: Vec<u8>,
    },
}

impl CookedAsset {
    pub fn size(&self) -> usize {
        match self {
            CookedAsset::Buffer { bytes } => bytes.len(),
            CookedAsset::Texture { pixels, .. } => pixels.len(),
        }
    }
}

#[derive(Debug)]
pub struct CookedPayload {
    pub handle: AssetHandle,
    pub label: String,
    pub asset: CookedAsset,
}

#[derive(Debug)]
pub enum LoadResult {
    Success(CookedPayload),
    Failure(AssetHandle, String),
}

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("failed to build asset loader thread pool: {0}")]
    ThreadPool(String),

    #[error("failed to spawn asset dispatch thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("pak entry {0:016x} not found")]
    MissingEntry(u64),

    #[error("malformed asset: {0}")]
    Malformed(String),
}

pub fn texture_format_code(format: TextureFormat) -> u32 {
    match format {
        TextureFormat::Rgba8Unorm => 0,
        TextureFormat::Rgba16Float => 1,
        TextureFormat::R32Uint => 2,
        TextureFormat::Depth32Float => 3,
    }
}

fn texture_format_from_code(code: u32) -> Option<TextureFormat> {
    match code {
        0 => Some(TextureFormat::Rgba8Unorm),
        1 => Some(TextureFormat::Rgba16Float),
        2 => Some(TextureFormat::R32Uint),
        3 => Some(TextureFormat::Depth32Float),
        _ => None,
    }
}

/// 写出烘焙纹理，供烘焙工具和测试使用
pub fn encode_texture_blob(width: u32, height: u32, format: TextureFormat, pixels: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(TEXTURE_BLOB_HEADER + pixels.len());
    out.extend_from_slice(&width.to_le_bytes());
    out.extend_from_slice(&height.to_le_bytes());
    out.extend_from_slice(&texture_format_code(format).to_le_bytes());
    out.extend_from_slice(pixels);
    out
}

fn read_source(source: &AssetSource) -> Result<Vec<u8>, LoaderError> {
    match source {
        AssetSource::Bytes(bytes) => Ok(bytes.to_vec()),
        AssetSource::Pak { archive, key } => archive
            .get(*key)
            .map(<[u8]>::to_vec)
            .ok_or(LoaderError::MissingEntry(*key)),
        AssetSource::File(path) => std::fs::read(path).map_err(|source| LoaderError::Io {
            path: path.clone(),
            source,
        }),
    }
}

/// 把烘焙数据解析成 GPU 可以直接上传的形式
pub fn cook(kind: AssetKind, raw: Vec<u8>) -> Result<CookedAsset, LoaderError> {
    match kind {
        AssetKind::Buffer => Ok(CookedAsset::Buffer { bytes: raw }),
        AssetKind::Texture => {
            let header = raw
                .get(..TEXTURE_BLOB_HEADER)
                .ok_or_else(|| LoaderError::Malformed(format!("texture blob of {} bytes", raw.len())))?;
            let word = |i: usize| u32::from_le_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]]);
            let (width, height, code) = (word(0), word(4), word(8));

            let format = texture_format_from_code(code)
                .ok_or_else(|| LoaderError::Malformed(format!("unknown texture format {}", code)))?;
            if width == 0 || height == 0 {
                return Err(LoaderError::Malformed(format!("empty texture {}x{}", width, height)));
            }
            let expected = width as usize * height as usize * format.bytes_per_pixel() as usize;
            let pixels = raw[TEXTURE_BLOB_HEADER..].to_vec();
            if pixels.len() != expected {
                return Err(LoaderError::Malformed(format!(
                    "{}x{} {:?} needs {} bytes, got {}",
                    width,
                    height,
                    format,
                    expected,
                    pixels.len()
                )));
            }
            Ok(CookedAsset::Texture {
                width,
                height,
                format,
                pixels,
            })
        }
    }
}

/// 实际的加载任务：读取 -> 解析
fn load_task(req: AssetLoadRequest) -> LoadResult {
    let _span = tracy_client::span!("load_task");
    log::debug!("loading asset \"{}\" from {:?}", req.label, req.source);

    match read_source(&req.source).and_then(|raw| cook(req.kind, raw)) {
        Ok(asset) => LoadResult::Success(CookedPayload {
            handle: req.handle,
            label: req.label,
            asset,
        }),
        Err(e) => {
            log::error!("failed to load asset \"{}\": {}", req.label, e);
            LoadResult::Failure(req.handle, e.to_string())
        }
    }
}

/// 负责管理后台加载任务。
///
/// ## 架构设计
/// - 内部的 `dispatch-thread` 负责调度：接收加载请求，分发任务到 worker
/// - rayon 提供 worker 线程池；`thread_pool_size` 为 0 时直接在调度线程上执行
/// - 结果通过有界 channel 发回，由渲染线程在阶段边界上取走
pub struct AssetLoader {
    request_sender: Option<Sender<AssetLoadRequest>>,
    result_receiver: Receiver<LoadResult>,

    dispatch_thread: Option<thread::JoinHandle<()>>,
}

impl AssetLoader {
    pub fn new(thread_pool_size: usize, inbox_capacity: usize) -> Result<Self, LoaderError> {
        let (req_tx, req_rx) = crossbeam_channel::unbounded::<AssetLoadRequest>();
        let (res_tx, res_rx) = crossbeam_channel::bounded::<LoadResult>(inbox_capacity.max(1));

        let pool = if thread_pool_size > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(thread_pool_size)
                .thread_name(|index| format!("Asset-Loader-{}", index))
                .build()
                .map_err(|e| LoaderError::ThreadPool(e.to_string()))?;
            Some(pool)
        } else {
            None
        };

        let dispatch_thread = thread::Builder::new()
            .name("AssetDispatchThread".to_string())
            .spawn(move || {
                let wait_group = WaitGroup::new();

                while let Ok(req) = req_rx.recv() {
                    let _span = tracy_client::span!("AssetLoader::dispatch");

                    let Some(pool) = &pool else {
                        let _ = res_tx.send(load_task(req));
                        continue;
                    };

                    let res_tx = res_tx.clone();
                    // 任务结束时 wg_task 随闭包一起 drop
                    let wg_task = wait_group.clone();
                    pool.spawn(move || {
                        let _ = res_tx.send(load_task(req));
                        drop(wg_task);
                    });
                }

                wait_group.wait();
            })
            .map_err(LoaderError::Spawn)?;

        log::info!("asset loader started with {} worker threads", thread_pool_size);
        Ok(Self {
            request_sender: Some(req_tx),
            result_receiver: res_rx,
            dispatch_thread: Some(dispatch_thread),
        })
    }

    pub fn request_load(&self, req: AssetLoadRequest) {
        if let Some(sender) = &self.request_sender
            && let Err(e) = sender.send(req)
        {
            log::error!("Failed to send asset load request: {}", e);
        }
    }

    pub fn try_recv_result(&self) -> Option<LoadResult> {
        self.result_receiver.try_recv().ok()
    }

    /// 阻塞等待下一个结果
    pub fn recv_result_timeout(&self, timeout: Duration) -> Option<LoadResult> {
        self.result_receiver.recv_timeout(timeout).ok()
    }
}

impl Drop for AssetLoader {
    fn drop(&mut self) {
        // 先断开请求 channel，调度线程才会退出 recv 循环
        self.request_sender = None;

        log::info!("AssetLoader is being dropped, waiting for tasks to complete...");
        if let Some(thread) = self.dispatch_thread.take() {
            // 结果 channel 是有界的，需要持续取走结果，worker 才不会阻塞在 send 上
            while !thread.is_finished() {
                while self.result_receiver.try_recv().is_ok() {}
                thread::yield_now();
            }
            if thread.join().is_err() {
                log::error!("Failed to join asset dispatch thread");
            }
        }
        log::info!("All asset tasks completed, AssetLoader dropped.");
    }
}
