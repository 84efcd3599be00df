// Remote-helper protocol engine for git's `connect` flavour
// After a connect, git talks to native receive-pack/upload-pack on the mirror;
// the engine compares mirror refs before and after and deposits on change.
use crate::credentials::Provisioner;
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::logging::LogHandle;
use crate::mirror::Mirror;
use crate::params::RemoteSpec;
use crate::runner::GitRunner;
use crate::snapshot::{self, Compression, RefsSnapshot};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Namespace of the refs flagging branches whose upload failed
pub const UPLOAD_FAILED_NAMESPACE: &str = "refs/dlra-upload-failed";

/// One line of the remote-helper protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Capabilities,
    Option { key: String, value: String },
    ConnectReceivePack,
    ConnectUploadPack,
    /// Empty line: git is done with us
    Terminate,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\n', '\r']);
        match line {
            "" => Command::Terminate,
            "capabilities" => Command::Capabilities,
            "connect git-receive-pack" => Command::ConnectReceivePack,
            "connect git-upload-pack" => Command::ConnectUploadPack,
            _ => match line.strip_prefix("option ") {
                Some(rest) => {
                    let (key, value) = rest.split_once(' ').unwrap_or((rest, ""));
                    Command::Option {
                        key: key.to_string(),
                        value: value.to_string(),
                    }
                }
                None => Command::Unknown(line.to_string()),
            },
        }
    }
}

/// Native pack program a `connect` hands the session to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackCommand {
    ReceivePack,
    UploadPack,
}

impl PackCommand {
    fn program(self) -> &'static str {
        match self {
            PackCommand::ReceivePack => "receive-pack",
            PackCommand::UploadPack => "upload-pack",
        }
    }
}

/// Serves a connected pack session against the mirror
#[async_trait]
pub trait PackService: Send + Sync {
    async fn serve(&self, command: PackCommand, mirror: &GitRunner) -> Result<()>;
}

/// Wires this process' own stdio to the native pack program
pub struct StdioPassthrough;

#[async_trait]
impl PackService for StdioPassthrough {
    async fn serve(&self, command: PackCommand, mirror: &GitRunner) -> Result<()> {
        let path = mirror.path().display().to_string();
        mirror.passthrough(&[command.program(), &path]).await
    }
}

/// Ref recording that `refname` was advanced locally but not deposited
pub fn upload_failed_ref(remote: &str, refname: &str) -> String {
    let short = refname
        .strip_prefix("refs/heads/")
        .or_else(|| refname.strip_prefix("refs/"))
        .unwrap_or(refname);
    format!("{UPLOAD_FAILED_NAMESPACE}/{remote}/{short}")
}

pub struct Engine {
    remote: String,
    spec: RemoteSpec,
    workdir: PathBuf,
    /// The local repository git runs us for
    repo: GitRunner,
    handle: Option<Handle>,
    mirror: Mirror,
    pack: Box<dyn PackService>,
    /// Remote refs once queried; inner `None` is an empty remote
    remote_refs: Option<Option<RefsSnapshot>>,
    verbosity: u32,
    provisioner: Provisioner,
    log: LogHandle,
}

impl Engine {
    pub fn new(
        remote: impl Into<String>,
        spec: RemoteSpec,
        workdir: PathBuf,
        repo: GitRunner,
        provisioner: Provisioner,
        log: LogHandle,
    ) -> Self {
        let mirror = Mirror::new(&workdir);
        Self {
            remote: remote.into(),
            spec,
            workdir,
            repo,
            handle: None,
            mirror,
            pack: Box::new(StdioPassthrough),
            remote_refs: None,
            verbosity: 1,
            provisioner,
            log,
        }
    }

    #[cfg(test)]
    fn with_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    #[cfg(test)]
    fn with_pack_service(mut self, pack: Box<dyn PackService>) -> Self {
        self.pack = pack;
        self
    }

    /// Serve one helper invocation, then tear the handle down
    pub async fn run<R, W>(mut self, input: R, output: &mut W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let result = self.communicate(input, output).await;
        if let Err(e) = self.close() {
            if result.is_ok() {
                return Err(e);
            }
            tracing::warn!("Failed to remove handle: {}", e);
        }
        result
    }

    fn close(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle.close(),
            None => Ok(()),
        }
    }

    pub async fn communicate<R, W>(&mut self, input: R, output: &mut W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        tracing::info!("Git remote startup: {} {:?}", self.remote, self.spec.params());
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            tracing::trace!("Received Git remote command: {:?}", line);
            match Command::parse(&line) {
                Command::Terminate => return Ok(()),
                Command::Capabilities => send(output, "option\nconnect\n\n").await?,
                Command::Option { key, value } => {
                    let reply = self.set_option(&key, &value);
                    send(output, &reply).await?;
                }
                Command::ConnectReceivePack => {
                    tracing::info!("Connecting git-receive-pack");
                    send(output, "\n").await?;
                    return self.receive_pack().await;
                }
                Command::ConnectUploadPack => {
                    tracing::info!("Connecting git-upload-pack");
                    send(output, "\n").await?;
                    return self.upload_pack().await;
                }
                Command::Unknown(line) => {
                    tracing::error!("Unknown remote-helper command {:?}", line);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn set_option(&mut self, key: &str, value: &str) -> String {
        match key {
            "verbosity" => match value.trim().parse::<u32>() {
                Ok(verbosity) => {
                    self.verbosity = verbosity;
                    self.log.set_verbosity(self.verbosity);
                    "ok\n".to_string()
                }
                Err(e) => {
                    let msg = e.to_string().replace('\n', "\\n");
                    tracing::warn!("Type-checking of \"option {} {}\" failed: {}", key, value, msg);
                    format!("error {msg}\n")
                }
            },
            _ => "unsupported\n".to_string(),
        }
    }

    async fn open_handle(&mut self) -> Result<&Handle> {
        if self.handle.is_none() {
            let env = self.provisioner.resolve(&self.spec).await?;
            let handle = Handle::open(&self.spec, &self.workdir, env.as_ref()).await?;
            tracing::debug!("Backend handle ready at {}", handle.path().display());
            self.handle = Some(handle);
        }
        self.handle
            .as_ref()
            .ok_or_else(|| Error::Protocol("backend handle unavailable".to_string()))
    }

    async fn remote_refs(&mut self) -> Result<Option<RefsSnapshot>> {
        if let Some(cached) = &self.remote_refs {
            return Ok(cached.clone());
        }
        let refs = snapshot::fetch_refs(self.open_handle().await?).await?;
        self.remote_refs = Some(refs.clone());
        Ok(refs)
    }

    async fn sync_mirror(&mut self) -> Result<()> {
        let remote = self.remote_refs().await?;
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| Error::Protocol("backend handle unavailable".to_string()))?;
        self.mirror.ensure_synced(remote.as_ref(), handle, &self.repo).await
    }

    async fn receive_pack(&mut self) -> Result<()> {
        self.sync_mirror().await?;
        let pre = self.mirror.refs().await?;
        self.pack.serve(PackCommand::ReceivePack, self.mirror.git()).await?;
        let post = self.mirror.refs().await?;
        self.finish_push(&pre, &post).await
    }

    async fn upload_pack(&mut self) -> Result<()> {
        self.sync_mirror().await?;
        self.pack.serve(PackCommand::UploadPack, self.mirror.git()).await?;
        self.provisioner.commit().await;
        Ok(())
    }

    /// Deposit the mirror if a push changed it or it differs from the
    /// remote, and flag every pushed ref when that fails
    async fn finish_push(&mut self, pre: &RefsSnapshot, post: &RefsSnapshot) -> Result<()> {
        let remote = self.remote_refs().await?;
        if pre != post || remote.as_ref() != Some(post) {
            if let Err(e) = self.deposit().await {
                // git already considers the push done; leave a trace
                tracing::error!("Remote update failed, flagging refs");
                if let Err(mark) = self.flag_upload_failed(post).await {
                    tracing::warn!("Could not flag refs: {}", mark);
                }
                return Err(e);
            }
            self.remote_refs = Some(Some(post.clone()));
        }

        self.clear_upload_failed().await?;
        self.provisioner.commit().await;
        Ok(())
    }

    async fn deposit(&mut self) -> Result<()> {
        let compression = if self.spec.is_uncompressed() {
            Compression::Stored
        } else {
            Compression::Deflated
        };
        let workdir = self.workdir.clone();
        let snap = snapshot::serialize(self.mirror.git(), &workdir, compression).await?;
        let handle = self.open_handle().await?;
        snapshot::deposit(handle, &snap, &workdir).await
    }

    async fn flag_upload_failed(&self, refs: &RefsSnapshot) -> Result<()> {
        for entry in refs.entries()? {
            let marker = upload_failed_ref(&self.remote, &entry.name);
            self.repo
                .call_git(&["update-ref", &marker, &entry.oid.to_hex()])
                .await?;
        }
        Ok(())
    }

    /// Whatever failed before, the remote now holds the synced mirror
    async fn clear_upload_failed(&self) -> Result<()> {
        let pattern = format!("{UPLOAD_FAILED_NAMESPACE}/{}", self.remote);
        let markers = self
            .repo
            .call_git(&["for-each-ref", "--format=%(refname)", &pattern])
            .await?;
        for marker in markers.lines().filter(|l| !l.is_empty()) {
            self.repo.call_git(&["update-ref", "-d", marker]).await?;
        }
        Ok(())
    }
}

async fn send<W: AsyncWrite + Unpin>(output: &mut W, msg: &str) -> Result<()> {
    output.write_all(msg.as_bytes()).await?;
    output.flush().await?;
    Ok(())
}
