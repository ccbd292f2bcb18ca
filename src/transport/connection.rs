//! Client side of the pack protocol over a pair of byte streams.
//!
//! A connection is created by a [`PackTransport`](super::PackTransport)
//! after it has read the remote's ref advertisement.  Fetched packs are
//! indexed into the local repository with `git index-pack`; pushed packs
//! are produced by `git pack-objects`.

use std::fmt;
use std::process::Stdio;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tracing::{debug, instrument, warn};

use super::TransportError;
use crate::git::pktline::{read_pkt, write_flush, write_pkt_line, PktLine};
use crate::git::{Git, Repository};

/// The all-zero object id used for ref creation and deletion.
pub const ZERO_OID: &str = "0000000000000000000000000000000000000000";

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ---------------------------------------------------------------------------
// Advertisement
// ---------------------------------------------------------------------------

/// One ref advertised by the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedRef {
    pub name: String,
    pub oid: String,
}

/// Refs and capabilities the remote sent before the first flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    pub refs: Vec<AdvertisedRef>,
    pub capabilities: Vec<String>,
}

impl Advertisement {
    pub fn get(&self, name: &str) -> Option<&AdvertisedRef> {
        self.refs.iter().find(|r| r.name == name)
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

fn hung_up(e: std::io::Error) -> TransportError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::HungUp
    } else {
        TransportError::Io(e)
    }
}

/// Read packets up to the first flush.  A stream that ends first means the
/// remote went away.
async fn read_section<R>(reader: &mut R) -> Result<Vec<String>, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut lines = Vec::new();
    loop {
        match read_pkt(reader).await.map_err(hung_up)? {
            None => return Err(TransportError::HungUp),
            Some(PktLine::Flush) => return Ok(lines),
            Some(pkt) => {
                let Some(text) = pkt.as_text() else {
                    return Err(TransportError::Protocol(format!("unexpected packet {pkt:?}")));
                };
                if let Some(message) = text.strip_prefix("ERR ") {
                    return Err(TransportError::Protocol(format!("remote error: {message}")));
                }
                lines.push(text);
            }
        }
    }
}

async fn read_advertisement<R>(reader: &mut R) -> Result<Advertisement, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut adv = Advertisement::default();
    for (i, line) in read_section(reader).await?.into_iter().enumerate() {
        let line = if i == 0 {
            match line.split_once('\0') {
                Some((head, caps)) => {
                    adv.capabilities = caps.split_whitespace().map(str::to_owned).collect();
                    head.to_string()
                }
                None => line,
            }
        } else {
            line
        };
        if line.starts_with("version ") {
            continue;
        }
        let (oid, name) = line
            .split_once(' ')
            .ok_or_else(|| TransportError::Protocol(format!("malformed ref line {line:?}")))?;
        // An empty repository advertises only its capabilities.
        if name == "capabilities^{}" {
            continue;
        }
        adv.refs.push(AdvertisedRef {
            name: name.to_string(),
            oid: oid.to_string(),
        });
    }
    debug!(refs = adv.refs.len(), "read ref advertisement");
    Ok(adv)
}

/// Reap the local end of a process transport once the exchange is over.
async fn reap(process: Option<Child>) {
    if let Some(mut child) = process {
        match child.wait().await {
            Ok(status) if !status.success() => debug!(%status, "pack process exited with error"),
            Err(e) => warn!(error = %e, "failed to wait on pack process"),
            Ok(_) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

/// An open fetch: the remote's advertisement has been read.
pub struct FetchConnection {
    reader: BoxedReader,
    writer: BoxedWriter,
    advertisement: Advertisement,
    local: Repository,
    git: Git,
    process: Option<Child>,
}

impl fmt::Debug for FetchConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchConnection")
            .field("advertisement", &self.advertisement)
            .field("local", &self.local)
            .finish()
    }
}

impl FetchConnection {
    pub(crate) async fn handshake(
        local: Repository,
        git: Git,
        mut reader: BoxedReader,
        writer: BoxedWriter,
    ) -> Result<Self, TransportError> {
        let advertisement = read_advertisement(&mut reader).await?;
        Ok(Self {
            reader,
            writer,
            advertisement,
            local,
            git,
            process: None,
        })
    }

    pub(crate) fn with_process(mut self, child: Child) -> Self {
        self.process = Some(child);
        self
    }

    pub fn advertisement(&self) -> &Advertisement {
        &self.advertisement
    }

    pub fn refs(&self) -> &[AdvertisedRef] {
        &self.advertisement.refs
    }

    /// Fetch `wants` into the local object store.  Refs are not updated.
    #[instrument(skip_all, fields(wants = wants.len()))]
    pub async fn fetch(mut self, wants: &[String]) -> Result<(), TransportError> {
        if wants.is_empty() {
            write_flush(&mut self.writer).await?;
            self.writer.shutdown().await?;
            reap(self.process).await;
            return Ok(());
        }

        for oid in wants {
            write_pkt_line(&mut self.writer, format!("want {oid}\n").as_bytes()).await?;
        }
        write_flush(&mut self.writer).await?;
        write_pkt_line(&mut self.writer, b"done\n").await?;
        self.writer.flush().await?;

        match read_pkt(&mut self.reader).await.map_err(hung_up)? {
            Some(pkt) if pkt.as_text().as_deref() == Some("NAK") => {}
            Some(pkt) => {
                return Err(TransportError::Protocol(format!("expected NAK, got {pkt:?}")));
            }
            None => return Err(TransportError::HungUp),
        }

        self.index_pack().await?;
        self.writer.shutdown().await?;
        reap(self.process).await;
        Ok(())
    }

    async fn index_pack(&mut self) -> Result<(), TransportError> {
        let mut cmd = self.git.with_git_dir(self.local.git_dir());
        cmd.args(["index-pack", "--stdin"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().context("failed to spawn git index-pack")?;
        let mut stdin = child.stdin.take().context("index-pack stdin was not piped")?;

        let copied = tokio::io::copy(&mut self.reader, &mut stdin).await;
        drop(stdin);
        let output = child
            .wait_with_output()
            .await
            .context("failed to wait on git index-pack")?;
        let copied = copied?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TransportError::Protocol(format!(
                "index-pack rejected the received pack: {}",
                stderr.trim()
            )));
        }
        debug!(bytes = copied, "indexed received pack");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Push
// ---------------------------------------------------------------------------

/// One ref to change on the remote.  `old` of `None` creates the ref,
/// `new` of `None` deletes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    pub name: String,
    pub old: Option<String>,
    pub new: Option<String>,
}

impl RefUpdate {
    fn is_delete(&self) -> bool {
        self.new.is_none()
    }

    fn command(&self) -> String {
        format!(
            "{} {} {}",
            self.old.as_deref().unwrap_or(ZERO_OID),
            self.new.as_deref().unwrap_or(ZERO_OID),
            self.name
        )
    }
}

/// Per-ref outcome in a push report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefStatus {
    pub name: String,
    /// `Err` carries the remote's reason.
    pub result: Result<(), String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReport {
    pub unpack: Result<(), String>,
    pub refs: Vec<RefStatus>,
}

impl PushReport {
    pub fn is_success(&self) -> bool {
        self.unpack.is_ok() && self.refs.iter().all(|r| r.result.is_ok())
    }

    fn parse(lines: &[String]) -> Result<Self, TransportError> {
        let mut lines = lines.iter();
        let unpack = match lines.next().and_then(|l| l.strip_prefix("unpack ")) {
            Some("ok") => Ok(()),
            Some(reason) => Err(reason.to_string()),
            None => return Err(TransportError::Protocol("missing unpack status".into())),
        };

        let mut refs = Vec::new();
        for line in lines {
            if let Some(name) = line.strip_prefix("ok ") {
                refs.push(RefStatus {
                    name: name.to_string(),
                    result: Ok(()),
                });
            } else if let Some(rest) = line.strip_prefix("ng ") {
                let (name, reason) = rest.split_once(' ').unwrap_or((rest, "rejected"));
                refs.push(RefStatus {
                    name: name.to_string(),
                    result: Err(reason.to_string()),
                });
            } else {
                return Err(TransportError::Protocol(format!("unexpected status line {line:?}")));
            }
        }
        Ok(Self { unpack, refs })
    }
}

/// An open push: the remote's advertisement has been read.
pub struct PushConnection {
    reader: BoxedReader,
    writer: BoxedWriter,
    advertisement: Advertisement,
    local: Repository,
    git: Git,
    process: Option<Child>,
}

impl fmt::Debug for PushConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushConnection")
            .field("advertisement", &self.advertisement)
            .field("local", &self.local)
            .finish()
    }
}

impl PushConnection {
    pub(crate) async fn handshake(
        local: Repository,
        git: Git,
        mut reader: BoxedReader,
        writer: BoxedWriter,
    ) -> Result<Self, TransportError> {
        let advertisement = read_advertisement(&mut reader).await?;
        Ok(Self {
            reader,
            writer,
            advertisement,
            local,
            git,
            process: None,
        })
    }

    pub(crate) fn with_process(mut self, child: Child) -> Self {
        self.process = Some(child);
        self
    }

    pub fn advertisement(&self) -> &Advertisement {
        &self.advertisement
    }

    pub fn refs(&self) -> &[AdvertisedRef] {
        &self.advertisement.refs
    }

    /// Send `updates` and the objects they need; return the remote's report.
    #[instrument(skip_all, fields(updates = updates.len()))]
    pub async fn push(mut self, updates: &[RefUpdate]) -> Result<PushReport, TransportError> {
        if updates.is_empty() {
            write_flush(&mut self.writer).await?;
            self.writer.shutdown().await?;
            reap(self.process).await;
            return Ok(PushReport {
                unpack: Ok(()),
                refs: Vec::new(),
            });
        }
        if !self.advertisement.has_capability("report-status") {
            return Err(TransportError::Protocol(
                "remote does not offer report-status".into(),
            ));
        }

        let mut capabilities = String::from("report-status");
        if updates.iter().any(RefUpdate::is_delete) {
            capabilities.push_str(" delete-refs");
        }
        for (i, update) in updates.iter().enumerate() {
            let line = if i == 0 {
                format!("{}\0{capabilities}\n", update.command())
            } else {
                format!("{}\n", update.command())
            };
            write_pkt_line(&mut self.writer, line.as_bytes()).await?;
        }
        write_flush(&mut self.writer).await?;

        if !updates.iter().all(RefUpdate::is_delete) {
            self.send_pack(updates).await?;
        }
        self.writer.flush().await?;
        self.writer.shutdown().await?;

        let lines = read_section(&mut self.reader).await?;
        let report = PushReport::parse(&lines)?;
        reap(self.process).await;
        Ok(report)
    }

    /// Stream a pack with everything reachable from the new tips that the
    /// remote does not already advertise.
    async fn send_pack(&mut self, updates: &[RefUpdate]) -> Result<(), TransportError> {
        let mut revs = String::new();
        for oid in updates.iter().filter_map(|u| u.new.as_deref()) {
            revs.push_str(oid);
            revs.push('\n');
        }
        for advertised in &self.advertisement.refs {
            if self
                .git
                .has_object(self.local.git_dir(), &advertised.oid)
                .await?
            {
                revs.push('^');
                revs.push_str(&advertised.oid);
                revs.push('\n');
            }
        }

        let mut cmd = self.git.with_git_dir(self.local.git_dir());
        cmd.args(["pack-objects", "--revs", "--stdout", "--quiet"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().context("failed to spawn git pack-objects")?;
        let mut stdin = child.stdin.take().context("pack-objects stdin was not piped")?;
        let mut stdout = child.stdout.take().context("pack-objects stdout was not piped")?;

        stdin.write_all(revs.as_bytes()).await?;
        drop(stdin);
        let copied = tokio::io::copy(&mut stdout, &mut self.writer).await?;
        let output = child
            .wait_with_output()
            .await
            .context("failed to wait on git pack-objects")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow::anyhow!("git pack-objects failed: {}", stderr.trim()).into());
        }
        debug!(bytes = copied, "sent pack");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::pktline::encode_pkt_line;

    fn wire(lines: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for line in lines {
            out.extend_from_slice(&encode_pkt_line(line));
        }
        out.extend_from_slice(b"0000");
        out
    }

    #[tokio::test]
    async fn parses_advertisement_with_capabilities() {
        let oid = "1111111111111111111111111111111111111111";
        let data = wire(&[
            format!("{oid} HEAD\0report-status delete-refs ofs-delta\n").as_bytes(),
            format!("{oid} refs/heads/master\n").as_bytes(),
        ]);
        let adv = read_advertisement(&mut data.as_slice()).await.unwrap();
        assert_eq!(adv.refs.len(), 2);
        assert_eq!(adv.get("refs/heads/master").unwrap().oid, oid);
        assert!(adv.has_capability("report-status"));
        assert!(!adv.has_capability("side-band-64k"));
    }

    #[tokio::test]
    async fn empty_repository_advertises_no_refs() {
        let data = wire(&[format!("{ZERO_OID} capabilities^{{}}\0report-status\n").as_bytes()]);
        let adv = read_advertisement(&mut data.as_slice()).await.unwrap();
        assert!(adv.refs.is_empty());
        assert!(adv.has_capability("report-status"));
    }

    #[tokio::test]
    async fn closed_stream_is_a_hang_up() {
        let err = read_advertisement(&mut &b""[..]).await.unwrap_err();
        assert!(matches!(err, TransportError::HungUp));

        // Ends in the middle of the advertisement.
        let mut data = encode_pkt_line(format!("{ZERO_OID} refs/heads/x\n").as_bytes());
        data.truncate(data.len() - 3);
        let err = read_advertisement(&mut data.as_slice()).await.unwrap_err();
        assert!(matches!(err, TransportError::HungUp));
    }

    #[tokio::test]
    async fn remote_err_line() {
        let data = wire(&[b"ERR access denied\n"]);
        let err = read_advertisement(&mut data.as_slice()).await.unwrap_err();
        assert!(matches!(err, TransportError::Protocol(msg) if msg.contains("access denied")));
    }

    #[test]
    fn parses_push_report() {
        let lines: Vec<String> = ["unpack ok", "ok refs/heads/master", "ng refs/heads/x non-fast-forward"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let report = PushReport::parse(&lines).unwrap();
        assert!(report.unpack.is_ok());
        assert_eq!(report.refs[0].result, Ok(()));
        assert_eq!(report.refs[1].result, Err("non-fast-forward".to_string()));
        assert!(!report.is_success());

        assert!(PushReport::parse(&[]).is_err());
    }

    #[test]
    fn ref_update_commands() {
        let create = RefUpdate {
            name: "refs/heads/x".into(),
            old: None,
            new: Some("a".repeat(40)),
        };
        assert_eq!(create.command(), format!("{ZERO_OID} {} refs/heads/x", "a".repeat(40)));
        let delete = RefUpdate {
            name: "refs/heads/x".into(),
            old: Some("a".repeat(40)),
            new: None,
        };
        assert!(delete.is_delete());
    }
}
