pub mod dump;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder, Retryable};
use fs2::FileExt;
use tokio::process::Command;
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::ipset::SetKind;
pub use dump::RuleDump;

/// One mutation against the ipset utility, as staged by the [`IpSetManager`](crate::ipset::IpSetManager).
#[derive(Clone, Debug, PartialEq)]
pub enum SetBatchOp {
    Create { hashed_name: String, kind: SetKind },
    Flush { hashed_name: String },
    Add { hashed_name: String, element: String },
    Destroy { hashed_name: String },
}

impl SetBatchOp {
    fn ipset_type(kind: SetKind) -> &'static str {
        match kind {
            SetKind::HashIp => "hash:ip",
            SetKind::HashIpPort => "hash:ip,port",
            SetKind::ListOfSets => "list:set",
        }
    }

    /// Renders this op as one line of the ipset-utility restore-file format (spec.md §6).
    fn render(&self) -> String {
        match self {
            SetBatchOp::Create { hashed_name, kind } => {
                format!("create {hashed_name} {} family inet -exist", Self::ipset_type(*kind))
            }
            SetBatchOp::Flush { hashed_name } => format!("flush {hashed_name}"),
            SetBatchOp::Add { hashed_name, element } => format!("add {hashed_name} {element}"),
            SetBatchOp::Destroy { hashed_name } => format!("destroy {hashed_name}"),
        }
    }
}

/// Operations the CORE needs from the host packet filter and ipset utility (spec.md §4.1).
///
/// Implementations own locking the shared kernel utility (a cooperative file lock with a
/// bounded wait) and retrying on transient contention; callers only see the three error
/// kinds from `spec.md` §7 (`TransientKernel`, `SyntaxReject`, `UtilityMissing`).
///
/// `#[async_trait]` rather than native `async fn` in trait so `Arc<dyn KernelShim>` can be
/// shared across controllers and the debug HTTP handler without a generic type parameter
/// threaded through every one of them.
#[async_trait]
pub trait KernelShim: Send + Sync {
    /// Returns a textual rule dump of the named table.
    async fn save(&self, table: &str) -> Result<RuleDump>;

    /// Atomically installs a rule dump, replacing the named table's current rules.
    async fn restore(&self, table: &str, dump: &RuleDump) -> Result<()>;

    /// Applies a batch of IP-set mutations.
    async fn set_apply(&self, ops: &[SetBatchOp]) -> Result<()>;

    async fn chain_exists(&self, table: &str, chain: &str) -> Result<bool>;

    /// Lists the concrete members of one ipset (spec.md §6 `list <name>`). Used by the debug
    /// converter to resolve a CIDR-blocks set's members from the live kernel (spec.md §4.7),
    /// since the offline rule-dump-plus-cache pair does not itself carry element contents.
    async fn list_set(&self, hashed_name: &str) -> Result<Vec<SetMember>>;
}

/// One member line parsed from the ipset utility's `list <name>` output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetMember {
    pub element: String,
    pub nomatch: bool,
}

/// Parses the `Members:` section of `ipset list <name>` output (spec.md §6).
fn parse_set_members(text: &str) -> Vec<SetMember> {
    let mut out = Vec::new();
    let mut in_members = false;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "Members:" {
            in_members = true;
            continue;
        }
        if !in_members {
            continue;
        }
        let nomatch = line.ends_with("nomatch");
        let element = line.trim_end_matches("nomatch").trim().to_string();
        out.push(SetMember { element, nomatch });
    }
    out
}

/// Real [`KernelShim`] backed by the host's `iptables`/`ipset` binaries, serialised behind
/// a cooperative file lock (spec.md §5: "the host packet-filter utility is a system-wide
/// singleton and MUST be accessed only through the shim").
pub struct ProcessKernelShim {
    lock_path: PathBuf,
    lock_timeout: Duration,
    iptables_bin: String,
    ipset_bin: String,
    ipset_restore_bin: String,
    iptables_restore_bin: String,
}

impl ProcessKernelShim {
    pub fn new(lock_path: impl Into<PathBuf>) -> Self {
        Self {
            lock_path: lock_path.into(),
            lock_timeout: Duration::from_secs(60),
            iptables_bin: "iptables-save".to_string(),
            ipset_bin: "ipset".to_string(),
            ipset_restore_bin: "ipset".to_string(),
            iptables_restore_bin: "iptables-restore".to_string(),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Acquires the cooperative file lock with a bounded wait, polling at a fixed interval
    /// because `fs2` only exposes blocking try-lock, not an async wait.
    async fn with_lock<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| Error::UtilityMissing(format!("cannot open lock file: {e}")))?;

        let deadline = tokio::time::Instant::now() + self.lock_timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(_) => {
                    return Err(Error::TransientKernel(
                        "timed out waiting for kernel utility lock".to_string(),
                    ));
                }
            }
        }
        let result = f().await;
        let _ = fs2::FileExt::unlock(&file);
        result
    }

    async fn run(&self, bin: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(bin)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::UtilityMissing(format!("{bin} not found: {e}"))
                } else {
                    Error::TransientKernel(format!("{bin} failed to spawn: {e}"))
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(Error::SyntaxReject(format!("{bin} exited with {}: {stderr}", output.status)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn run_with_stdin(&self, bin: &str, args: &[&str], stdin: &str) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut child = Command::new(bin)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::UtilityMissing(format!("{bin} not found: {e}"))
                } else {
                    Error::TransientKernel(format!("{bin} failed to spawn: {e}"))
                }
            })?;

        if let Some(mut stdin_pipe) = child.stdin.take() {
            stdin_pipe
                .write_all(stdin.as_bytes())
                .await
                .map_err(|e| Error::Io(format!("{bin} stdin write"), e))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::Io(format!("{bin} wait"), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(Error::SyntaxReject(format!("{bin} exited with {}: {stderr}", output.status)));
        }
        Ok(())
    }
}

#[async_trait]
impl KernelShim for ProcessKernelShim {
    async fn save(&self, table: &str) -> Result<RuleDump> {
        self.with_lock(|| async {
            let text = self.run(&self.iptables_bin, &["-t", table]).await?;
            dump::parse(&text)
        })
        .await
    }

    async fn restore(&self, table: &str, rule_dump: &RuleDump) -> Result<()> {
        let text = dump::render(rule_dump);
        let retry = ExponentialBuilder::default().with_max_times(3);
        (|| async {
            self.with_lock(|| async {
                self.run_with_stdin(&self.iptables_restore_bin, &["-t", table], &text)
                    .await
            })
            .await
        })
        .retry(retry)
        .when(|e| matches!(e, Error::TransientKernel(_)))
        .notify(|e, dur| warn!(msg = "retrying kernel restore", error = %e, delay = ?dur))
        .await
    }

    async fn set_apply(&self, ops: &[SetBatchOp]) -> Result<()> {
        let text = ops
            .iter()
            .map(SetBatchOp::render)
            .collect::<Vec<_>>()
            .join("\n")
            + "\n";
        trace!(msg = "applying ipset batch", ops = ops.len());
        let retry = ExponentialBuilder::default().with_max_times(3);
        (|| async {
            self.with_lock(|| async {
                self.run_with_stdin(&self.ipset_restore_bin, &["restore"], &text)
                    .await
            })
            .await
        })
        .retry(retry)
        .when(|e| matches!(e, Error::TransientKernel(_)))
        .await
    }

    async fn chain_exists(&self, table: &str, chain: &str) -> Result<bool> {
        match self
            .run(&self.iptables_bin, &["-t", table, "-L", chain, "-n"])
            .await
        {
            Ok(_) => Ok(true),
            Err(Error::SyntaxReject(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list_set(&self, hashed_name: &str) -> Result<Vec<SetMember>> {
        let text = self.run(&self.ipset_bin, &["list", hashed_name]).await?;
        Ok(parse_set_members(&text))
    }
}

/// In-memory shim for unit tests: records calls, replays a canned `save()` result, and can be
/// told to fail the next `set_apply`/`restore` to exercise the "leave dirty list intact"
/// retry path.
#[derive(Default)]
pub struct MockShim {
    set_apply_calls: AtomicUsize,
    restore_calls: AtomicUsize,
    fail_next: std::sync::atomic::AtomicBool,
    canned_save: std::sync::Mutex<RuleDump>,
    canned_members: std::sync::Mutex<std::collections::HashMap<String, Vec<SetMember>>>,
}

impl MockShim {
    pub fn failing() -> Self {
        let shim = Self::default();
        shim.fail_next.store(true, Ordering::SeqCst);
        shim
    }

    pub fn set_apply_calls(&self) -> usize {
        self.set_apply_calls.load(Ordering::SeqCst)
    }

    pub fn restore_calls(&self) -> usize {
        self.restore_calls.load(Ordering::SeqCst)
    }

    pub fn set_canned_save(&self, dump: RuleDump) {
        *self.canned_save.lock().unwrap() = dump;
    }

    pub fn set_canned_members(&self, hashed_name: &str, members: Vec<SetMember>) {
        self.canned_members
            .lock()
            .unwrap()
            .insert(hashed_name.to_string(), members);
    }
}

#[async_trait]
impl KernelShim for MockShim {
    async fn save(&self, _table: &str) -> Result<RuleDump> {
        Ok(self.canned_save.lock().unwrap().clone())
    }

    async fn restore(&self, _table: &str, _dump: &RuleDump) -> Result<()> {
        self.restore_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::TransientKernel("mock failure".to_string()));
        }
        Ok(())
    }

    async fn set_apply(&self, _ops: &[SetBatchOp]) -> Result<()> {
        self.set_apply_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::TransientKernel("mock failure".to_string()));
        }
        Ok(())
    }

    async fn chain_exists(&self, _table: &str, chain: &str) -> Result<bool> {
        Ok(self
            .canned_save
            .lock()
            .unwrap()
            .chains
            .iter()
            .any(|c| c.name == chain))
    }

    async fn list_set(&self, hashed_name: &str) -> Result<Vec<SetMember>> {
        Ok(self
            .canned_members
            .lock()
            .unwrap()
            .get(hashed_name)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_create_flush_add_destroy() {
        let ops = vec![
            SetBatchOp::Create {
                hashed_name: "azure-npm-1".into(),
                kind: SetKind::HashIp,
            },
            SetBatchOp::Flush {
                hashed_name: "azure-npm-1".into(),
            },
            SetBatchOp::Add {
                hashed_name: "azure-npm-1".into(),
                element: "10.0.0.1".into(),
            },
            SetBatchOp::Destroy {
                hashed_name: "azure-npm-2".into(),
            },
        ];
        let rendered: Vec<String> = ops.iter().map(SetBatchOp::render).collect();
        assert_eq!(rendered[0], "create azure-npm-1 hash:ip family inet -exist");
        assert_eq!(rendered[1], "flush azure-npm-1");
        assert_eq!(rendered[2], "add azure-npm-1 10.0.0.1");
        assert_eq!(rendered[3], "destroy azure-npm-2");
    }

    #[test]
    fn parses_members_with_nomatch_suffix() {
        let text = "\
Name: azure-npm-1
Type: hash:net
Members:
10.0.0.0/8
10.0.1.0/24 nomatch
";
        let members = parse_set_members(text);
        assert_eq!(members.len(), 2);
        assert_eq!(members[0], SetMember { element: "10.0.0.0/8".to_string(), nomatch: false });
        assert_eq!(members[1], SetMember { element: "10.0.1.0/24".to_string(), nomatch: true });
    }
}
