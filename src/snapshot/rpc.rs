//! Structured snapshot strategy over the `criu swrk` protocol.
//!
//! A SOCK_SEQPACKET socketpair is shared with a `criu swrk <fd>` child; each
//! datagram carries one protobuf `criu_req` / `criu_resp`. Only the fields
//! this crate sets are declared; unknown response fields are skipped on
//! decode. Directories are passed as open fds, which CRIU reopens through
//! `/proc/<peer>/fd`.

use super::{resolve_binary, CgroupMode, DumpOptions, EngineFuture, EngineStrategy, RestoreOptions};
use crate::mounts::merge_restore_descriptors;
use anyhow::{anyhow, bail, Context};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{recv, send, socketpair, AddressFamily, MsgFlags, SockFlag, SockType};
use prost::Message;
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::process::{Command, Stdio};

/// Largest response datagram accepted from CRIU.
const RESP_BUF_SIZE: usize = 2 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ReqType {
    Empty = 0,
    Dump = 1,
    Restore = 2,
    Check = 3,
    PreDump = 4,
    Notify = 6,
    Version = 10,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum CgMode {
    Ignore = 0,
    CgNone = 1,
    Props = 2,
    Soft = 3,
    Full = 4,
    Strict = 5,
    CgDefault = 6,
}

impl From<CgroupMode> for CgMode {
    fn from(mode: CgroupMode) -> Self {
        match mode {
            CgroupMode::Ignore => Self::Ignore,
            CgroupMode::None => Self::CgNone,
            CgroupMode::Props => Self::Props,
            CgroupMode::Soft => Self::Soft,
            CgroupMode::Full => Self::Full,
            CgroupMode::Strict => Self::Strict,
            CgroupMode::Default => Self::CgDefault,
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CriuOpts {
    #[prost(int32, required, tag = "1")]
    pub images_dir_fd: i32,
    #[prost(int32, optional, tag = "2")]
    pub pid: Option<i32>,
    #[prost(bool, optional, tag = "3")]
    pub leave_running: Option<bool>,
    #[prost(bool, optional, tag = "4")]
    pub ext_unix_sk: Option<bool>,
    #[prost(bool, optional, tag = "5")]
    pub tcp_established: Option<bool>,
    #[prost(bool, optional, tag = "7")]
    pub shell_job: Option<bool>,
    #[prost(bool, optional, tag = "8")]
    pub file_locks: Option<bool>,
    #[prost(int32, optional, tag = "9")]
    pub log_level: Option<i32>,
    #[prost(string, optional, tag = "10")]
    pub log_file: Option<String>,
    #[prost(bool, optional, tag = "15")]
    pub track_mem: Option<bool>,
    #[prost(int32, optional, tag = "17")]
    pub work_dir_fd: Option<i32>,
    #[prost(bool, optional, tag = "24")]
    pub manage_cgroups: Option<bool>,
    #[prost(bool, optional, tag = "26")]
    pub rst_sibling: Option<bool>,
    #[prost(enumeration = "CgMode", optional, tag = "34")]
    pub manage_cgroups_mode: Option<i32>,
    #[prost(string, repeated, tag = "37")]
    pub external: Vec<String>,
    #[prost(uint32, optional, tag = "38")]
    pub empty_ns: Option<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CriuReq {
    #[prost(enumeration = "ReqType", required, tag = "1")]
    pub req_type: i32,
    #[prost(message, optional, tag = "2")]
    pub opts: Option<CriuOpts>,
    #[prost(bool, optional, tag = "3")]
    pub notify_success: Option<bool>,
    #[prost(bool, optional, tag = "4")]
    pub keep_open: Option<bool>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CriuDumpResp {
    #[prost(bool, optional, tag = "1")]
    pub restored: Option<bool>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CriuRestoreResp {
    #[prost(int32, required, tag = "1")]
    pub pid: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CriuResp {
    #[prost(enumeration = "ReqType", required, tag = "1")]
    pub resp_type: i32,
    #[prost(bool, required, tag = "2")]
    pub success: bool,
    #[prost(message, optional, tag = "3")]
    pub dump: Option<CriuDumpResp>,
    #[prost(message, optional, tag = "4")]
    pub restore: Option<CriuRestoreResp>,
    #[prost(int32, optional, tag = "7")]
    pub cr_errno: Option<i32>,
    #[prost(string, optional, tag = "9")]
    pub cr_errmsg: Option<String>,
}

pub fn dump_request(opts: &DumpOptions, images_fd: i32, work_fd: i32, req_type: ReqType) -> CriuReq {
    CriuReq {
        req_type: req_type as i32,
        opts: Some(CriuOpts {
            images_dir_fd: images_fd,
            work_dir_fd: Some(work_fd),
            pid: Some(opts.pid as i32),
            log_file: Some(opts.log_file.clone()),
            log_level: Some(opts.log_level),
            leave_running: Some(opts.leave_running),
            ext_unix_sk: Some(opts.ext_unix_sk),
            tcp_established: Some(opts.tcp_established),
            shell_job: Some(opts.shell_job),
            file_locks: Some(opts.file_locks),
            track_mem: opts.track_mem.then_some(true),
            manage_cgroups: Some(opts.manage_cgroups),
            manage_cgroups_mode: opts
                .manage_cgroups
                .then(|| CgMode::from(opts.cgroup_mode) as i32),
            external: opts.external.clone(),
            ..CriuOpts::default()
        }),
        ..CriuReq::default()
    }
}

pub fn restore_request(opts: &RestoreOptions, images_fd: i32, work_fd: i32) -> CriuReq {
    let external = merge_restore_descriptors(&opts.external, &opts.ext_mount_map);

    CriuReq {
        req_type: ReqType::Restore as i32,
        opts: Some(CriuOpts {
            images_dir_fd: images_fd,
            work_dir_fd: Some(work_fd),
            log_file: Some(opts.log_file.clone()),
            log_level: Some(opts.log_level),
            tcp_established: Some(opts.tcp_established),
            shell_job: Some(opts.shell_job),
            rst_sibling: Some(opts.restore_sibling),
            manage_cgroups: Some(opts.manage_cgroups),
            manage_cgroups_mode: opts
                .manage_cgroups
                .then(|| CgMode::from(opts.cgroup_mode) as i32),
            empty_ns: (opts.empty_ns != 0).then_some(opts.empty_ns),
            external,
            ..CriuOpts::default()
        }),
        ..CriuReq::default()
    }
}

/// Turn an unsuccessful response into an error carrying CRIU's errno/message.
pub fn check_response(resp: &CriuResp, action: &str) -> anyhow::Result<()> {
    if resp.success {
        return Ok(());
    }
    let errno = resp.cr_errno.unwrap_or_default();
    let msg = resp.cr_errmsg.as_deref().unwrap_or("no message");
    if errno != 0 {
        bail!("criu {} failed (errno {}): {}", action, errno, msg);
    }
    bail!("criu {} failed: {}", action, msg)
}

pub struct CriuRpc {
    criu_binary: String,
}

impl CriuRpc {
    pub fn new(criu_binary: impl Into<String>) -> Self {
        Self {
            criu_binary: criu_binary.into(),
        }
    }

    async fn call_blocking<F>(&self, work_dir: &Path, images_dir: &Path, build: F) -> anyhow::Result<CriuResp>
    where
        F: FnOnce(i32, i32) -> CriuReq + Send + 'static,
    {
        let binary = self.criu_binary.clone();
        let work_dir = work_dir.to_path_buf();
        let images_dir = images_dir.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let images = File::open(&images_dir)
                .with_context(|| format!("open images dir {}", images_dir.display()))?;
            let work = File::open(&work_dir)
                .with_context(|| format!("open work dir {}", work_dir.display()))?;
            let req = build(images.as_raw_fd(), work.as_raw_fd());
            // the dir fds must stay open until CRIU answers
            let resp = swrk_call(&binary, &req);
            drop(images);
            drop(work);
            resp
        })
        .await
        .context("engine task panicked")?
    }
}

/// Run one request against a fresh `criu swrk` child and wait for it to exit.
fn swrk_call(binary: &str, req: &CriuReq) -> anyhow::Result<CriuResp> {
    let (parent, child): (OwnedFd, OwnedFd) = socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::empty(),
    )
    .context("socketpair")?;
    fcntl(parent.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).context("set cloexec")?;

    let mut proc = Command::new(binary)
        .arg("swrk")
        .arg(child.as_raw_fd().to_string())
        .stdin(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to spawn {} swrk", binary))?;
    drop(child);

    let result = exchange(parent.as_raw_fd(), req);
    drop(parent);

    let status = proc.wait().context("wait for criu swrk")?;
    tracing::debug!(%status, "criu swrk exited");
    result
}

fn exchange(fd: i32, req: &CriuReq) -> anyhow::Result<CriuResp> {
    send(fd, &req.encode_to_vec(), MsgFlags::empty()).context("send request")?;

    let mut buf = vec![0u8; RESP_BUF_SIZE];
    loop {
        let n = recv(fd, &mut buf, MsgFlags::empty()).context("receive response")?;
        if n == 0 {
            return Err(anyhow!("criu swrk closed the socket without a response"));
        }
        let resp = CriuResp::decode(&buf[..n]).context("decode response")?;

        // no notify scripts are registered; acknowledge and keep waiting
        if resp.resp_type == ReqType::Notify as i32 {
            let ack = CriuReq {
                req_type: ReqType::Notify as i32,
                notify_success: Some(true),
                ..CriuReq::default()
            };
            send(fd, &ack.encode_to_vec(), MsgFlags::empty()).context("acknowledge notify")?;
            continue;
        }
        return Ok(resp);
    }
}

impl EngineStrategy for CriuRpc {
    fn name(&self) -> &'static str {
        "rpc"
    }

    fn is_available(&self) -> bool {
        resolve_binary(&self.criu_binary).is_some()
    }

    fn pre_dump<'a>(&'a self, opts: &'a DumpOptions) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            let owned = opts.clone();
            let resp = self
                .call_blocking(&opts.work_dir, &opts.images_dir, move |images, work| {
                    dump_request(&owned, images, work, ReqType::PreDump)
                })
                .await?;
            check_response(&resp, "pre-dump")
        })
    }

    fn dump<'a>(&'a self, opts: &'a DumpOptions) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            let owned = opts.clone();
            let resp = self
                .call_blocking(&opts.work_dir, &opts.images_dir, move |images, work| {
                    dump_request(&owned, images, work, ReqType::Dump)
                })
                .await?;
            check_response(&resp, "dump")
        })
    }

    fn restore<'a>(&'a self, opts: &'a RestoreOptions) -> EngineFuture<'a, Option<i32>> {
        Box::pin(async move {
            let owned = opts.clone();
            let resp = self
                .call_blocking(&opts.work_dir, &opts.images_dir, move |images, work| {
                    restore_request(&owned, images, work)
                })
                .await?;
            check_response(&resp, "restore")?;
            Ok(resp.restore.map(|r| r.pid))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RestoreConfig;
    use crate::extract::SYSTEM_MOUNTS;
    use crate::mounts::descriptor_container_path;
    use crate::restore::restore_options;
    use crate::storage::CheckpointDir;
    use crate::types::MountMapping;

    fn dump_opts() -> DumpOptions {
        let mut opts = DumpOptions::new(4242, Path::new("/cp"), Path::new("/cp/images"));
        opts.external = vec!["mnt[/data]".into()];
        opts.manage_cgroups = true;
        opts.leave_running = true;
        opts
    }

    #[test]
    fn test_dump_request_fields() {
        let req = dump_request(&dump_opts(), 10, 11, ReqType::Dump);
        assert_eq!(req.req_type, ReqType::Dump as i32);
        let opts = req.opts.unwrap();
        assert_eq!(opts.images_dir_fd, 10);
        assert_eq!(opts.work_dir_fd, Some(11));
        assert_eq!(opts.pid, Some(4242));
        assert_eq!(opts.log_file.as_deref(), Some("dump.log"));
        assert_eq!(opts.ext_unix_sk, Some(true));
        assert_eq!(opts.leave_running, Some(true));
        assert_eq!(opts.manage_cgroups_mode, Some(CgMode::Soft as i32));
        assert_eq!(opts.track_mem, None);
        assert_eq!(opts.external, vec!["mnt[/data]".to_string()]);
    }

    #[test]
    fn test_pre_dump_request_tracks_memory() {
        let req = dump_request(&dump_opts().for_pre_dump(), 10, 11, ReqType::PreDump);
        assert_eq!(req.req_type, ReqType::PreDump as i32);
        let opts = req.opts.unwrap();
        assert_eq!(opts.track_mem, Some(true));
        assert_eq!(opts.tcp_established, Some(false));
    }

    #[test]
    fn test_restore_request_merges_mount_map() {
        let mut opts = RestoreOptions::new(Path::new("/cp"), Path::new("/cp/images"));
        opts.external = vec!["mnt[/data]:/tmp/d1".into()];
        opts.ext_mount_map = vec!["auto:/data:/tmp/d1".into(), "auto:/logs:/var/log/app".into()];
        opts.restore_sibling = true;

        let req = restore_request(&opts, 3, 4);
        assert_eq!(req.req_type, ReqType::Restore as i32);
        let o = req.opts.unwrap();
        assert_eq!(
            o.external,
            vec!["mnt[/data]:/tmp/d1".to_string(), "auto:/logs:/var/log/app".to_string()]
        );
        assert_eq!(o.rst_sibling, Some(true));
        assert_eq!(o.empty_ns, Some(libc::CLONE_NEWNS as u32));
        assert_eq!(o.manage_cgroups_mode, None);
        assert_eq!(o.pid, None);
    }

    #[test]
    fn test_restore_request_skipped_mount_absent() {
        let mut mappings = vec![MountMapping::external("/data", "/tmp/d1", "bind")];
        mappings.extend(
            SYSTEM_MOUNTS
                .iter()
                .map(|(p, fs)| MountMapping::external(p, p, fs)),
        );
        let mut config = RestoreConfig::from_dir("/out/c1/cp");
        config.skip_mounts = vec!["/data".into()];
        let opts = restore_options(&CheckpointDir::new("/out/c1/cp"), &mappings, &config);

        let external = restore_request(&opts, 3, 4).opts.unwrap().external;
        let paths: Vec<&str> = external
            .iter()
            .map(|d| descriptor_container_path(d).unwrap())
            .collect();
        assert!(!paths.contains(&"/data"), "skipped mount sent: {:?}", external);
        for safe in ["/proc", "/dev", "/sys"] {
            assert!(paths.contains(&safe));
        }
        let mut seen = std::collections::HashSet::new();
        assert!(paths.iter().all(|p| seen.insert(*p)), "duplicate path in {:?}", external);
    }

    #[test]
    fn test_request_wire_round_trip() {
        let req = dump_request(&dump_opts(), 10, 11, ReqType::Dump);
        let bytes = req.encode_to_vec();
        let decoded = CriuReq::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_check_response() {
        let ok = CriuResp {
            resp_type: ReqType::Dump as i32,
            success: true,
            ..CriuResp::default()
        };
        assert!(check_response(&ok, "dump").is_ok());

        let failed = CriuResp {
            resp_type: ReqType::Dump as i32,
            success: false,
            cr_errno: Some(2),
            cr_errmsg: Some("mount /data has no mapping".into()),
            ..CriuResp::default()
        };
        let msg = check_response(&failed, "dump").unwrap_err().to_string();
        assert!(msg.contains("errno 2"));
        assert!(msg.contains("mount /data has no mapping"));
    }

    #[test]
    fn test_restore_response_pid() {
        let resp = CriuResp {
            resp_type: ReqType::Restore as i32,
            success: true,
            restore: Some(CriuRestoreResp { pid: 777 }),
            ..CriuResp::default()
        };
        let decoded = CriuResp::decode(resp.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.restore.map(|r| r.pid), Some(777));
    }

    #[test]
    fn test_cgroup_mode_values() {
        assert_eq!(CgMode::from(CgroupMode::Soft) as i32, 3);
        assert_eq!(CgMode::from(CgroupMode::Default) as i32, 6);
    }
}
