//! A Tokio-based client/server library for the performance-metrics
//! wire protocol: framed PDU transport and codecs, a derived-metric
//! expression engine, the archive metadata store, request-port and
//! secure-handshake plumbing for servers, and service discovery.

pub mod archive;
pub mod deriv;
pub mod desc;
pub mod discover;
pub mod error;
pub mod ident;
pub mod labels;
pub mod options;
pub mod pdu;
pub mod profile;
pub mod result;
pub mod server;
pub mod timestamp;
pub mod units;
pub mod value;

use fxhash::FxHashMap;
use tracing::debug;

use crate::deriv::{DerivedRegistry, MetadataSource};
use crate::desc::Descriptor;
use crate::error::{Error, Result};
use crate::ident::{IndomId, InstId, MetricId};
use crate::labels::{LabelSet, LabelTarget};
use crate::pdu::instance::InstanceReply;
use crate::pdu::{PduStream, PduType, SizeLimit, Wait};
use crate::profile::Profile;
use crate::result::FetchResult;
use crate::timestamp::Timestamp;

/// Client-side metadata cache backing the expression engine for live
/// contexts; archive contexts use [`archive::ArchiveSource`] instead.
#[derive(Default)]
pub struct CachedMetadata {
    descs: FxHashMap<MetricId, Descriptor>,
    names: FxHashMap<String, MetricId>,
    indoms: FxHashMap<IndomId, Vec<(InstId, String)>>,
}

impl CachedMetadata {
    pub fn new() -> CachedMetadata {
        CachedMetadata::default()
    }

    pub fn insert_desc(&mut self, desc: Descriptor) {
        self.descs.insert(desc.pmid, desc);
    }

    pub fn insert_name<S: Into<String>>(&mut self, name: S, pmid: MetricId) {
        self.names.insert(name.into(), pmid);
    }

    pub fn insert_indom(&mut self, indom: IndomId, instances: Vec<(InstId, String)>) {
        self.indoms.insert(indom, instances);
    }
}

impl MetadataSource for CachedMetadata {
    fn desc(&self, pmid: MetricId) -> Result<Descriptor> {
        self.descs.get(&pmid).copied().ok_or(Error::NoSuchMetric)
    }

    fn pmid(&self, name: &str) -> Result<MetricId> {
        self.names.get(name).copied().ok_or(Error::NoSuchMetric)
    }

    fn lookup_inst(&self, indom: IndomId, name: &str, _at: Option<Timestamp>) -> Result<InstId> {
        let instances = self.indoms.get(&indom).ok_or(Error::NoSuchIndom)?;
        instances
            .iter()
            .find(|(_, n)| n == name || n.split(' ').next() == Some(name))
            .map(|(inst, _)| *inst)
            .ok_or(Error::NoSuchInstance)
    }

    fn inst_name(&self, indom: IndomId, inst: InstId, _at: Option<Timestamp>) -> Result<String> {
        let instances = self.indoms.get(&indom).ok_or(Error::NoSuchIndom)?;
        instances
            .iter()
            .find(|(i, _)| *i == inst)
            .map(|(_, n)| n.clone())
            .ok_or(Error::NoSuchInstance)
    }
}

/// A session with a live collector.
///
/// The context owns the framed connection, the per-context instance
/// profile, the derived-metric registry and a metadata cache; fetches
/// run the full pre-fetch augmentation and post-fetch rewrite.
pub struct Context {
    stream: PduStream,
    ctxid: u32,
    profile: Profile,
    profile_sent: bool,
    derived: DerivedRegistry,
    meta: CachedMetadata,
}

impl Context {
    /// Connect to the collector named by a host specification, e.g.
    /// `collector1`, `collector1:44321` or `local:`.
    pub async fn connect<S: AsRef<str>>(spec: S) -> Result<Context> {
        let spec = options::HostSpec::parse(spec.as_ref())?;
        let stream = PduStream::connect(&spec).await?;
        Ok(Context::from_stream(stream))
    }

    pub fn from_stream(stream: PduStream) -> Context {
        Context {
            stream,
            ctxid: 0,
            profile: Profile::default(),
            profile_sent: false,
            derived: DerivedRegistry::new(),
            meta: CachedMetadata::new(),
        }
    }

    pub fn metadata_mut(&mut self) -> &mut CachedMetadata {
        &mut self.meta
    }

    /// Register a derived metric for this context; it is bound lazily
    /// on the first fetch that mentions the returned id.
    pub fn register_derived(&mut self, name: &str, expr: &str) -> Result<MetricId> {
        let pmid = self.derived.register(name, expr)?;
        self.meta.insert_name(name, pmid);
        Ok(pmid)
    }

    pub fn profile_mut(&mut self) -> &mut Profile {
        self.profile_sent = false;
        &mut self.profile
    }

    async fn transact(&mut self, frame: &[u8]) -> Result<pdu::Frame> {
        self.stream.send(frame).await?;
        let reply = self
            .stream
            .recv(SizeLimit::Any, Wait::Default)
            .await?
            .ok_or(Error::Ipc("connection closed mid-request"))?;
        if reply.typed() == Some(PduType::Error) {
            let code = pdu::desc::decode_error(&reply)?;
            return Err(Error::from_code(code));
        }
        Ok(reply)
    }

    async fn flush_profile(&mut self) -> Result<()> {
        if self.profile_sent {
            return Ok(());
        }
        let frame = pdu::profile::encode(0, self.ctxid, &self.profile);
        self.stream.send(&frame).await?;
        self.profile_sent = true;
        Ok(())
    }

    /// Sample the named metrics.  Derived ids are augmented with their
    /// operands on the way out and rewritten with computed values on
    /// the way back; the receive buffer is released once the rewritten
    /// result owns all its values.
    pub async fn fetch(&mut self, pmids: &[MetricId]) -> Result<FetchResult> {
        self.flush_profile().await?;
        let send_list = self.derived.prefetch(&self.meta, pmids);
        let wire_list = send_list.as_deref().unwrap_or(pmids);
        let frame = pdu::idlist::encode_fetch(0, self.ctxid, wire_list);
        let reply = self.transact(&frame).await?;
        if reply.typed() != Some(PduType::Result) {
            return Err(Error::Ipc("expected a result frame"));
        }
        let decoded = pdu::result::decode(&reply)?;
        let rewritten = match send_list {
            None => decoded,
            Some(_) => self.derived.postfetch(&self.meta, decoded),
        };
        debug!(metrics = rewritten.vsets.len(), "fetch complete");
        Ok(rewritten)
    }

    /// The instances of `indom`, cached for instance-filter expressions.
    pub async fn instances(&mut self, indom: IndomId) -> Result<InstanceReply> {
        let frame = pdu::instance::encode_req(0, indom, None, None);
        let reply = self.transact(&frame).await?;
        if reply.typed() != Some(PduType::Instance) {
            return Err(Error::Ipc("expected an instance frame"));
        }
        let decoded = pdu::instance::decode_reply(&reply)?;
        if let (Some(ids), Some(names)) = (&decoded.instances, &decoded.names) {
            self.meta.insert_indom(
                decoded.indom,
                ids.iter().copied().zip(names.iter().cloned()).collect(),
            );
        }
        Ok(decoded)
    }

    /// The descriptor for one metric, cached for the expression engine.
    pub async fn lookup_desc(&mut self, pmid: MetricId) -> Result<Descriptor> {
        if let Ok(desc) = self.meta.desc(pmid) {
            return Ok(desc);
        }
        let frame = pdu::desc::encode_req(0, pmid);
        let reply = self.transact(&frame).await?;
        if reply.typed() != Some(PduType::Desc) {
            return Err(Error::Ipc("expected a descriptor frame"));
        }
        let desc = pdu::desc::decode_desc(&reply)?;
        self.meta.insert_desc(desc);
        Ok(desc)
    }

    pub async fn lookup_text(&mut self, ident: u32, kind: u32) -> Result<String> {
        let frame = pdu::text::encode_req(0, ident, kind);
        let reply = self.transact(&frame).await?;
        if reply.typed() != Some(PduType::Text) {
            return Err(Error::Ipc("expected a text frame"));
        }
        let (_, text) = pdu::text::decode_reply(&reply)?;
        Ok(text)
    }

    pub async fn lookup_labels(
        &mut self,
        ident: u32,
        target: LabelTarget,
    ) -> Result<Vec<LabelSet>> {
        let frame = pdu::label::encode_req(0, ident, target);
        let reply = self.transact(&frame).await?;
        if reply.typed() != Some(PduType::Label) {
            return Err(Error::Ipc("expected a label frame"));
        }
        let (_, _, sets) = pdu::label::decode_reply(&reply)?;
        Ok(sets)
    }

    pub async fn close(mut self) -> Result<()> {
        self.stream.shutdown().await
    }
}
