//! WASM sandbox runner.
//!
//! The module is compiled once per runner instance; every message gets a
//! fresh instantiation with its own WASI context: stdin carries the
//! encoded message, stdout is captured for decoding, the environment is
//! filtered through a deny-list, memory growth is capped, and an optional
//! mount is exposed read-only at a fixed virtual root.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bridge_codec::{MessageCodec, codec_for};
use bridge_message::RunnerMessage;
use bridge_vfs::SafeFs;
use serde::Deserialize;
use tracing::{debug, warn};
use wasmtime::{Config, Engine, Linker, Module, Store, StoreLimits, StoreLimitsBuilder, Trap};
use wasmtime_wasi::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{DirPerms, FilePerms, I32Exit, WasiCtxBuilder};

use crate::error::{RunnerError, RunnerResult};
use crate::runner::Runner;

/// Bytes per WebAssembly memory page.
const WASM_PAGE_SIZE: usize = 64 * 1024;
/// Default memory cap in pages (16 MiB).
const DEFAULT_MAX_MEMORY_PAGES: u32 = 256;
/// Hard upper bound on the configurable memory cap.
const MAX_MEMORY_PAGES_LIMIT: u32 = 65_536;
/// Captured stdout/stderr caps.
const STDOUT_CAPACITY: usize = 10 * 1024 * 1024;
const STDERR_CAPACITY: usize = 64 * 1024;
/// Engine epoch tick used to realize per-message deadlines.
const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Virtual root the mount is exposed at inside the guest.
const GUEST_MOUNT_ROOT: &str = "/data";

/// Configuration for [`WasmRunner`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct WasmRunnerConfig {
    /// Path to the `.wasm` (or `.wat`) module on the host.
    pub module_path: String,
    /// Codec token for the stdin/stdout framing. Defaults to `cli`.
    #[serde(default = "default_format")]
    pub format: String,
    /// Per-message timeout in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Environment passed to the module.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Environment keys never exposed to the module (exact match).
    #[serde(default)]
    pub deny_env_vars: Vec<String>,
    /// Guest argv (after the module name).
    #[serde(default)]
    pub args: Vec<String>,
    /// Host directory exposed at the guest's virtual root.
    #[serde(default)]
    pub mount_path: Option<String>,
    /// Reject all writes through the mount. Defaults to true.
    #[serde(default = "default_true")]
    pub read_only_mount: bool,
    /// Memory cap in 64 KiB pages. Defaults to 256 (16 MiB).
    #[serde(default = "default_pages")]
    pub max_memory_pages: u32,
}

fn default_format() -> String {
    "cli".to_string()
}

fn default_timeout() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_pages() -> u32 {
    DEFAULT_MAX_MEMORY_PAGES
}

/// Per-store state: WASI context plus resource limits.
struct StoreState {
    wasi: WasiP1Ctx,
    limits: StoreLimits,
}

/// Compiles a module once and instantiates it per message inside a WASI
/// sandbox.
pub struct WasmRunner {
    engine: Engine,
    module: Module,
    linker: Linker<StoreState>,
    codec: Arc<dyn MessageCodec>,
    config: WasmRunnerConfig,
    mount: Option<SafeFs>,
    timeout: Duration,
    stop: Arc<AtomicBool>,
}

impl WasmRunner {
    /// Compile the module and prepare the sandbox template.
    ///
    /// # Errors
    ///
    /// Surfaces configuration problems (memory cap out of range, missing
    /// or traversing mount path, unknown codec token) and compilation
    /// failures.
    pub fn new(config: WasmRunnerConfig) -> RunnerResult<Self> {
        if config.max_memory_pages == 0 || config.max_memory_pages > MAX_MEMORY_PAGES_LIMIT {
            return Err(RunnerError::Config(format!(
                "maxMemoryPages must be in 1..={MAX_MEMORY_PAGES_LIMIT}, got {}",
                config.max_memory_pages
            )));
        }

        let codec = codec_for(&config.format)?;
        let mount = config
            .mount_path
            .as_deref()
            .map(|path| validated_mount(path, config.read_only_mount))
            .transpose()?;

        let mut engine_config = Config::new();
        engine_config.async_support(true);
        engine_config.epoch_interruption(true);
        let engine =
            Engine::new(&engine_config).map_err(|e| RunnerError::Wasm(e.to_string()))?;

        let module = Module::from_file(&engine, &config.module_path)
            .map_err(|e| RunnerError::Config(format!("module compile failed: {e}")))?;

        let mut linker = Linker::new(&engine);
        preview1::add_to_linker_async(&mut linker, |state: &mut StoreState| &mut state.wasi)
            .map_err(|e| RunnerError::Wasm(e.to_string()))?;

        // One engine-wide ticker realizes every store's deadline; each
        // store sets its deadline in ticks relative to the current epoch,
        // so concurrent messages never interrupt each other. The ticker
        // is a dedicated OS thread: guest code can occupy an executor
        // thread for a full deadline, and the interrupt must still fire.
        let stop = Arc::new(AtomicBool::new(false));
        let ticker_engine = engine.clone();
        let ticker_stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            while !ticker_stop.load(Ordering::Relaxed) {
                std::thread::sleep(EPOCH_TICK);
                ticker_engine.increment_epoch();
            }
        });

        let timeout = Duration::from_millis(config.timeout);
        Ok(Self {
            engine,
            module,
            linker,
            codec,
            config,
            mount,
            timeout,
            stop,
        })
    }

    fn build_store(&self, stdin: MemoryInputPipe, stdout: MemoryOutputPipe, stderr: MemoryOutputPipe) -> RunnerResult<Store<StoreState>> {
        let mut builder = WasiCtxBuilder::new();
        builder.stdin(stdin);
        builder.stdout(stdout);
        builder.stderr(stderr);

        let module_name = Path::new(&self.config.module_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "module".to_string());
        let mut argv = vec![module_name];
        argv.extend(self.config.args.iter().cloned());
        builder.args(&argv);

        for (key, value) in filtered_env(&self.config.env, &self.config.deny_env_vars) {
            builder.env(key, value);
        }

        if let Some(mount) = &self.mount {
            let (dir_perms, file_perms) = if self.config.read_only_mount {
                (DirPerms::READ, FilePerms::READ)
            } else {
                (DirPerms::all(), FilePerms::all())
            };
            builder
                .preopened_dir(mount.root(), GUEST_MOUNT_ROOT, dir_perms, file_perms)
                .map_err(|e| RunnerError::Config(format!("mount failed: {e}")))?;
        }

        let limits = StoreLimitsBuilder::new()
            .memory_size(self.config.max_memory_pages as usize * WASM_PAGE_SIZE)
            .build();

        let mut store = Store::new(
            &self.engine,
            StoreState {
                wasi: builder.build_p1(),
                limits,
            },
        );
        store.limiter(|state| &mut state.limits);

        let deadline_ticks = (self.timeout.as_millis() as u64 / EPOCH_TICK.as_millis() as u64) + 1;
        store.set_epoch_deadline(deadline_ticks);
        Ok(store)
    }
}

#[async_trait]
impl Runner for WasmRunner {
    async fn process(&self, msg: &mut RunnerMessage) -> RunnerResult<()> {
        if self.stop.load(Ordering::Relaxed) {
            return Err(RunnerError::Wasm("runner is closed".to_string()));
        }

        let metadata = msg.metadata().await?;
        let data = msg.data().await?;
        let encoded = self.codec.encode(&metadata, &data)?;

        let stdout = MemoryOutputPipe::new(STDOUT_CAPACITY);
        let stderr = MemoryOutputPipe::new(STDERR_CAPACITY);
        let mut store = self.build_store(
            MemoryInputPipe::new(encoded),
            stdout.clone(),
            stderr.clone(),
        )?;

        let run = async {
            let instance = self
                .linker
                .instantiate_async(&mut store, &self.module)
                .await?;
            let start = instance.get_typed_func::<(), ()>(&mut store, "_start")?;
            start.call_async(&mut store, ()).await
        };

        if let Err(e) = run.await {
            let stderr_text = String::from_utf8_lossy(&stderr.contents()).into_owned();
            if matches!(e.downcast_ref::<Trap>(), Some(Trap::Interrupt)) {
                warn!(
                    module = %self.config.module_path,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "module interrupted by deadline"
                );
                return Err(RunnerError::Timeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
            match e.downcast_ref::<I32Exit>() {
                Some(I32Exit(0)) => {},
                Some(I32Exit(code)) => {
                    return Err(RunnerError::Wasm(format!(
                        "module exited with status {code}: {stderr_text}"
                    )));
                },
                None => {
                    return Err(RunnerError::Wasm(format!("{e}: {stderr_text}")));
                },
            }
        }
        drop(store);

        let stderr_bytes = stderr.contents();
        if !stderr_bytes.is_empty() {
            debug!(target: "bridge_runner::wasm", "{}", String::from_utf8_lossy(&stderr_bytes));
        }

        let envelope = self.codec.decode(&stdout.contents())?;
        msg.set_from_envelope(envelope)?;
        Ok(())
    }

    async fn close(&self) -> RunnerResult<()> {
        self.stop.store(true, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for WasmRunner {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Drop deny-listed keys (exact, case-sensitive match).
fn filtered_env<'a>(
    env: &'a BTreeMap<String, String>,
    deny: &'a [String],
) -> impl Iterator<Item = (&'a str, &'a str)> {
    env.iter()
        .filter(move |(key, _)| !deny.iter().any(|d| d == *key))
        .map(|(k, v)| (k.as_str(), v.as_str()))
}

fn validated_mount(path: &str, read_only: bool) -> RunnerResult<SafeFs> {
    if Path::new(path)
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(RunnerError::Validation(format!(
            "mountPath {path:?} contains parent traversal"
        )));
    }
    let meta = std::fs::metadata(path)
        .map_err(|e| RunnerError::Config(format!("mountPath {path:?}: {e}")))?;
    if !meta.is_dir() {
        return Err(RunnerError::Config(format!(
            "mountPath {path:?} is not a directory"
        )));
    }
    Ok(SafeFs::new(path).read_only(read_only))
}

#[cfg(test)]
mod tests {
    use bridge_message::{Envelope, Metadata};
    use bytes::Bytes;

    use super::*;

    /// WASI module that copies stdin to stdout.
    const ECHO_WAT: &str = r#"
        (module
          (import "wasi_snapshot_preview1" "fd_read"
            (func $fd_read (param i32 i32 i32 i32) (result i32)))
          (import "wasi_snapshot_preview1" "fd_write"
            (func $fd_write (param i32 i32 i32 i32) (result i32)))
          (memory (export "memory") 2)
          (func (export "_start")
            (local $n i32)
            (block $done
              (loop $again
                (i32.store (i32.const 0) (i32.const 64))
                (i32.store (i32.const 4) (i32.const 4096))
                (br_if $done
                  (i32.ne
                    (call $fd_read (i32.const 0) (i32.const 0) (i32.const 1) (i32.const 16))
                    (i32.const 0)))
                (local.set $n (i32.load (i32.const 16)))
                (br_if $done (i32.eqz (local.get $n)))
                (i32.store (i32.const 0) (i32.const 64))
                (i32.store (i32.const 4) (local.get $n))
                (drop
                  (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 24)))
                (br $again))))
        )
    "#;

    /// Module that never returns.
    const SPIN_WAT: &str = "(module (func (export \"_start\") (loop (br 0))))";

    /// WASI module that reads its single environment entry, then replies
    /// with a frame tagging the entry's value as `test-env-value`
    /// metadata and prefixing the payload with `processed:`. Expects a
    /// metadata-free input frame (16 byte header, payload after).
    const ENV_TAG_WAT: &str = r#"
        (module
          (import "wasi_snapshot_preview1" "fd_read"
            (func $fd_read (param i32 i32 i32 i32) (result i32)))
          (import "wasi_snapshot_preview1" "fd_write"
            (func $fd_write (param i32 i32 i32 i32) (result i32)))
          (import "wasi_snapshot_preview1" "environ_sizes_get"
            (func $environ_sizes_get (param i32 i32) (result i32)))
          (import "wasi_snapshot_preview1" "environ_get"
            (func $environ_get (param i32 i32) (result i32)))
          (memory (export "memory") 2)
          (data (i32.const 1536) "processed:")
          (data (i32.const 1552) "test-env-value")

          (func $store_be32 (param $p i32) (param $v i32)
            (i32.store8 (local.get $p) (i32.shr_u (local.get $v) (i32.const 24)))
            (i32.store8 (i32.add (local.get $p) (i32.const 1))
              (i32.shr_u (local.get $v) (i32.const 16)))
            (i32.store8 (i32.add (local.get $p) (i32.const 2))
              (i32.shr_u (local.get $v) (i32.const 8)))
            (i32.store8 (i32.add (local.get $p) (i32.const 3)) (local.get $v)))

          (func (export "_start")
            (local $in_len i32)
            (local $n i32)
            (local $val_ptr i32)
            (local $val_len i32)
            (local $data_len i32)
            (local $out i32)

            ;; read the whole input frame into 2048..
            (block $read_done
              (loop $read
                (i32.store (i32.const 0) (i32.add (i32.const 2048) (local.get $in_len)))
                (i32.store (i32.const 4) (i32.sub (i32.const 8192) (local.get $in_len)))
                (br_if $read_done
                  (i32.ne
                    (call $fd_read (i32.const 0) (i32.const 0) (i32.const 1) (i32.const 16))
                    (i32.const 0)))
                (local.set $n (i32.load (i32.const 16)))
                (br_if $read_done (i32.eqz (local.get $n)))
                (local.set $in_len (i32.add (local.get $in_len) (local.get $n)))
                (br $read)))

            ;; payload follows the 16 byte metadata-free frame header
            (local.set $data_len (i32.sub (local.get $in_len) (i32.const 16)))

            ;; locate the value of the single environment entry, if any
            (drop (call $environ_sizes_get (i32.const 32) (i32.const 36)))
            (drop (call $environ_get (i32.const 48) (i32.const 256)))
            (if (i32.gt_u (i32.load (i32.const 32)) (i32.const 0))
              (then
                (local.set $val_ptr (i32.load (i32.const 48)))
                (block $eq_done
                  (loop $eq_scan
                    (br_if $eq_done
                      (i32.eq (i32.load8_u (local.get $val_ptr)) (i32.const 61)))
                    (br_if $eq_done (i32.eqz (i32.load8_u (local.get $val_ptr))))
                    (local.set $val_ptr (i32.add (local.get $val_ptr) (i32.const 1)))
                    (br $eq_scan)))
                (local.set $val_ptr (i32.add (local.get $val_ptr) (i32.const 1)))
                (block $nul_done
                  (loop $nul_scan
                    (br_if $nul_done
                      (i32.eqz
                        (i32.load8_u
                          (i32.add (local.get $val_ptr) (local.get $val_len)))))
                    (local.set $val_len (i32.add (local.get $val_len) (i32.const 1)))
                    (br $nul_scan)))))

            ;; assemble the reply frame at 16384
            (local.set $out (i32.const 16384))
            (i32.store (local.get $out) (i32.const 0x31464245))
            (local.set $out (i32.add (local.get $out) (i32.const 4)))
            (call $store_be32 (local.get $out) (i32.const 1))
            (local.set $out (i32.add (local.get $out) (i32.const 4)))
            (call $store_be32 (local.get $out) (i32.const 14))
            (local.set $out (i32.add (local.get $out) (i32.const 4)))
            (memory.copy (local.get $out) (i32.const 1552) (i32.const 14))
            (local.set $out (i32.add (local.get $out) (i32.const 14)))
            (call $store_be32 (local.get $out) (local.get $val_len))
            (local.set $out (i32.add (local.get $out) (i32.const 4)))
            (memory.copy (local.get $out) (local.get $val_ptr) (local.get $val_len))
            (local.set $out (i32.add (local.get $out) (local.get $val_len)))
            (call $store_be32 (local.get $out) (i32.const 0))
            (local.set $out (i32.add (local.get $out) (i32.const 4)))
            (call $store_be32 (local.get $out)
              (i32.add (i32.const 10) (local.get $data_len)))
            (local.set $out (i32.add (local.get $out) (i32.const 4)))
            (memory.copy (local.get $out) (i32.const 1536) (i32.const 10))
            (local.set $out (i32.add (local.get $out) (i32.const 10)))
            (memory.copy (local.get $out)
              (i32.add (i32.const 2048) (i32.const 16)) (local.get $data_len))
            (local.set $out (i32.add (local.get $out) (local.get $data_len)))

            ;; write the frame to stdout
            (i32.store (i32.const 0) (i32.const 16384))
            (i32.store (i32.const 4) (i32.sub (local.get $out) (i32.const 16384)))
            (drop
              (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 24))))
        )
    "#;

    fn write_module(dir: &tempfile::TempDir, name: &str, wat: &str) -> String {
        let path = dir.path().join(name);
        std::fs::write(&path, wat).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn config(module_path: String) -> WasmRunnerConfig {
        WasmRunnerConfig {
            module_path,
            format: "cli".to_string(),
            timeout: 30_000,
            env: BTreeMap::new(),
            deny_env_vars: Vec::new(),
            args: Vec::new(),
            mount_path: None,
            read_only_mount: true,
            max_memory_pages: DEFAULT_MAX_MEMORY_PAGES,
        }
    }

    #[tokio::test]
    async fn test_echo_module_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let runner = WasmRunner::new(config(write_module(&dir, "echo.wat", ECHO_WAT))).unwrap();

        let metadata = Metadata::try_from_pairs([("k1", "v1"), ("k2", "v2")]).unwrap();
        let mut msg = RunnerMessage::new(Arc::new(Envelope::new(
            metadata,
            Bytes::from_static(b"abc"),
        )));

        runner.process(&mut msg).await.unwrap();

        assert_eq!(msg.data().await.unwrap(), Bytes::from_static(b"abc"));
        let meta = msg.metadata().await.unwrap();
        assert_eq!(meta.get("k1"), Some("v1"));
        assert_eq!(meta.get("k2"), Some("v2"));
        runner.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_fresh_instance_per_message() {
        let dir = tempfile::tempdir().unwrap();
        let runner = WasmRunner::new(config(write_module(&dir, "echo.wat", ECHO_WAT))).unwrap();

        for payload in [&b"first"[..], &b"second"[..], &b"third"[..]] {
            let mut msg = RunnerMessage::new(Arc::new(Envelope::new(
                Metadata::new(),
                Bytes::copy_from_slice(payload),
            )));
            runner.process(&mut msg).await.unwrap();
            assert_eq!(msg.data().await.unwrap(), Bytes::copy_from_slice(payload));
        }
        runner.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_env_module_prefixes_data_and_tags_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(write_module(&dir, "env_tag.wat", ENV_TAG_WAT));
        cfg.env = [("TEST_ENV".to_string(), "value".to_string())].into();
        let runner = WasmRunner::new(cfg).unwrap();

        let mut msg = RunnerMessage::new(Arc::new(Envelope::new(
            Metadata::new(),
            Bytes::from_static(b"abc"),
        )));
        runner.process(&mut msg).await.unwrap();

        let data = msg.data().await.unwrap();
        assert!(data.starts_with(b"processed:"));
        assert_eq!(data, Bytes::from_static(b"processed:abc"));
        assert_eq!(
            msg.metadata().await.unwrap().get("test-env-value"),
            Some("value")
        );
        runner.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_denied_env_never_reaches_the_module() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(write_module(&dir, "env_tag.wat", ENV_TAG_WAT));
        cfg.env = [("TEST_ENV".to_string(), "value".to_string())].into();
        cfg.deny_env_vars = vec!["TEST_ENV".to_string()];
        let runner = WasmRunner::new(cfg).unwrap();

        let mut msg = RunnerMessage::new(Arc::new(Envelope::new(
            Metadata::new(),
            Bytes::from_static(b"abc"),
        )));
        runner.process(&mut msg).await.unwrap();

        // The module still replies, but it saw an empty environment.
        assert_eq!(msg.data().await.unwrap(), Bytes::from_static(b"processed:abc"));
        assert_eq!(msg.metadata().await.unwrap().get("test-env-value"), Some(""));
        runner.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_infinite_loop_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(write_module(&dir, "spin.wat", SPIN_WAT));
        cfg.timeout = 500;
        let runner = WasmRunner::new(cfg).unwrap();

        let mut msg = RunnerMessage::new(Arc::new(Envelope::default()));
        let start = std::time::Instant::now();
        let err = runner.process(&mut msg).await.unwrap_err();
        assert!(matches!(err, RunnerError::Timeout { timeout_ms: 500 }));
        assert!(start.elapsed() < Duration::from_secs(2));
        runner.close().await.unwrap();
    }

    #[test]
    fn test_env_deny_list_filtering() {
        let env: BTreeMap<String, String> = [
            ("KEEP".to_string(), "1".to_string()),
            ("SECRET".to_string(), "2".to_string()),
            ("secret".to_string(), "3".to_string()),
        ]
        .into();
        let deny = vec!["SECRET".to_string()];

        let kept: Vec<_> = filtered_env(&env, &deny).map(|(k, _)| k).collect();
        // Exact-match, case-sensitive: lowercase "secret" survives.
        assert_eq!(kept, ["KEEP", "secret"]);
    }

    #[test]
    fn test_memory_pages_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_module(&dir, "echo.wat", ECHO_WAT);

        let mut cfg = config(path.clone());
        cfg.max_memory_pages = 0;
        assert!(matches!(WasmRunner::new(cfg), Err(RunnerError::Config(_))));

        let mut cfg = config(path);
        cfg.max_memory_pages = MAX_MEMORY_PAGES_LIMIT + 1;
        assert!(matches!(WasmRunner::new(cfg), Err(RunnerError::Config(_))));
    }

    #[test]
    fn test_mount_traversal_rejected() {
        let err = validated_mount("/tmp/../etc", true).unwrap_err();
        assert!(matches!(err, RunnerError::Validation(_)));
    }
}
