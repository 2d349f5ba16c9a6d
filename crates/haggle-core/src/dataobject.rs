//! Content-addressed data objects
//!
//! A data object is an immutable record of weighted attributes plus an
//! optional payload. Its 20-byte id is a SHA-1 over the sorted attributes
//! and the payload hash, which must come out identical on every node that
//! computes it. Mutation after construction is limited to the stored /
//! duplicate flags and receive metadata.

use crate::attribute::{Attribute, AttributeSet, WEIGHT_DEFAULT};
use crate::error::{Error, Result};
use crate::interface::InterfaceKey;
use crate::metadata::{Metadata, ATTRIBUTE_TAG, HAGGLE_TAG};
use crate::time::Timestamp;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const DATAOBJECT_ID_LEN: usize = 20;

/// 20-byte content-derived identifier
pub type DataObjectId = [u8; DATAOBJECT_ID_LEN];

const DATA_TAG: &str = "Data";
const SIGNATURE_TAG: &str = "Signature";

/// Counter for in-memory publishes spilled to `mem-dObj-<n>.do`
static SPILL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Verification state of the object-level signature. The core carries
/// signatures opaquely and never verifies them.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum SignatureStatus {
    #[default]
    Missing,
    Unverified,
    Valid,
    Invalid,
}

#[derive(Debug, Default)]
struct DynamicState {
    stored: bool,
    duplicate: bool,
    receive_time: Option<Timestamp>,
    received_on: Option<InterfaceKey>,
}

/// An immutable content record plus optional payload
#[derive(Debug, Serialize, Deserialize)]
pub struct DataObject {
    attributes: AttributeSet,
    create_time: Option<Timestamp>,
    persistent: bool,

    file_path: Option<PathBuf>,
    file_name: Option<String>,
    data_len: u64,
    data_hash: Option<[u8; DATAOBJECT_ID_LEN]>,
    thumbnail: Option<Vec<u8>>,
    /// Payload file created by this node (spill or receive); deleted on drop
    /// unless the object was stored
    owns_payload: bool,

    signature_status: SignatureStatus,
    signee: Option<String>,
    signature: Option<Vec<u8>>,

    /// Root children that are not part of the core vocabulary (e.g. the
    /// `Node` element of a node description), preserved verbatim
    extensions: Vec<Metadata>,

    id: DataObjectId,

    #[serde(skip)]
    dynamic: Mutex<DynamicState>,
}

/// Shared handle to a data object
pub type DataObjectRef = Arc<DataObject>;

impl DataObject {
    /// Metadata-only object (control messages, node descriptions)
    pub fn from_attributes(attributes: AttributeSet, persistent: bool) -> DataObject {
        let mut dobj = DataObject {
            attributes,
            create_time: Some(Timestamp::now()),
            persistent,
            file_path: None,
            file_name: None,
            data_len: 0,
            data_hash: None,
            thumbnail: None,
            owns_payload: false,
            signature_status: SignatureStatus::Missing,
            signee: None,
            signature: None,
            extensions: Vec::new(),
            id: [0; DATAOBJECT_ID_LEN],
            dynamic: Mutex::new(DynamicState::default()),
        };
        dobj.id = dobj.calculate_id();
        dobj
    }

    /// Local publish of an existing file; the file is hashed but not copied
    pub fn from_file(path: impl Into<PathBuf>, attributes: AttributeSet) -> Result<DataObject> {
        let path = path.into();
        let meta = std::fs::metadata(&path)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::InvalidParameter(format!("not a file: {}", path.display())))?;
        let data_hash = hash_file(&path)?;

        let mut dobj = DataObject::from_attributes(attributes, true);
        dobj.file_name = Some(file_name);
        dobj.data_len = meta.len();
        dobj.data_hash = Some(data_hash);
        dobj.file_path = Some(path);
        dobj.id = dobj.calculate_id();
        Ok(dobj)
    }

    /// Local publish of an in-memory buffer, spilled to a
    /// `mem-dObj-<n>.do` file in the storage directory
    pub fn from_buffer(
        storage_dir: &Path,
        data: &[u8],
        attributes: AttributeSet,
    ) -> Result<DataObject> {
        let n = SPILL_COUNTER.fetch_add(1, Ordering::Relaxed);
        let file_name = format!("mem-dObj-{n}.do");
        let path = storage_dir.join(&file_name);
        let mut file = File::create(&path)?;
        file.write_all(data)?;

        let mut dobj = DataObject::from_attributes(attributes, true);
        dobj.file_name = Some(file_name);
        dobj.data_len = data.len() as u64;
        dobj.data_hash = Some(Sha1::digest(data).into());
        dobj.file_path = Some(path);
        dobj.owns_payload = true;
        dobj.id = dobj.calculate_id();
        Ok(dobj)
    }

    /// Reconstruct from a received metadata document. The payload, if any,
    /// arrives separately and is attached with [`attach_payload`].
    ///
    /// [`attach_payload`]: DataObject::attach_payload
    pub fn from_metadata(doc: &Metadata) -> Result<DataObject> {
        if doc.name() != HAGGLE_TAG {
            return Err(Error::Metadata(format!("bad root element: {}", doc.name())));
        }

        let mut attributes = AttributeSet::new();
        for child in doc.children_named(ATTRIBUTE_TAG) {
            let name = child
                .parameter("name")
                .ok_or_else(|| Error::Metadata("attribute without name".into()))?;
            let value = child.content().unwrap_or_default();
            let weight = match child.parameter("weight") {
                Some(w) => w
                    .parse()
                    .map_err(|_| Error::Metadata(format!("bad weight: {w}")))?,
                None => WEIGHT_DEFAULT,
            };
            attributes.add(Attribute::with_weight(name, value, weight));
        }

        let persistent = !matches!(doc.parameter("persistent"), Some("no"));
        let create_time = doc.parameter("create_time").and_then(Timestamp::parse);

        let mut dobj = DataObject::from_attributes(attributes, persistent);
        dobj.create_time = create_time;

        if let Some(data) = doc.child(DATA_TAG) {
            if let Some(len) = data.parameter("data_len") {
                dobj.data_len = len
                    .parse()
                    .map_err(|_| Error::Metadata(format!("bad data_len: {len}")))?;
            }
            dobj.file_name = data
                .child("Filename")
                .and_then(|c| c.content())
                .map(str::to_owned);
            if let Some(hash) = data.child("FileHash").and_then(|c| c.content()) {
                let decoded = BASE64.decode(hash.trim())?;
                let hash: [u8; DATAOBJECT_ID_LEN] = decoded
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Metadata("file hash is not 20 bytes".into()))?;
                dobj.data_hash = Some(hash);
            }
            dobj.file_path = data
                .child("FilePath")
                .and_then(|c| c.content())
                .map(PathBuf::from);
            if let Some(thumb) = data.child("Thumbnail").and_then(|c| c.content()) {
                dobj.thumbnail = Some(BASE64.decode(thumb.trim())?);
            }
        }

        if let Some(sig) = doc.child(SIGNATURE_TAG) {
            dobj.signee = sig.parameter("signee").map(str::to_owned);
            if let Some(content) = sig.content() {
                dobj.signature = Some(BASE64.decode(content.trim())?);
                dobj.signature_status = SignatureStatus::Unverified;
            }
        }

        for child in doc.children() {
            if !matches!(child.name(), ATTRIBUTE_TAG | DATA_TAG | SIGNATURE_TAG) {
                dobj.extensions.push(child.clone());
            }
        }

        dobj.id = dobj.calculate_id();
        Ok(dobj)
    }

    pub fn from_metadata_bytes(bytes: &[u8]) -> Result<DataObject> {
        Self::from_metadata(&Metadata::from_xml(bytes)?)
    }

    /// Serialize to the metadata document form
    pub fn to_metadata(&self) -> Metadata {
        let mut doc = Metadata::new(HAGGLE_TAG);
        doc.set_parameter("persistent", if self.persistent { "yes" } else { "no" });
        if let Some(ts) = self.create_time {
            doc.set_parameter("create_time", ts);
        }

        for attr in &self.attributes {
            let mut elem = Metadata::with_content(ATTRIBUTE_TAG, attr.value());
            elem.set_parameter("name", attr.name());
            if attr.weight() != WEIGHT_DEFAULT {
                elem.set_parameter("weight", attr.weight());
            }
            doc.add_child(elem);
        }

        if self.has_payload() {
            let mut data = Metadata::new(DATA_TAG);
            data.set_parameter("data_len", self.data_len);
            if let Some(name) = &self.file_name {
                data.add_child(Metadata::with_content("Filename", name));
            }
            if let Some(hash) = &self.data_hash {
                data.add_child(Metadata::with_content("FileHash", BASE64.encode(hash)));
            }
            if let Some(path) = &self.file_path {
                data.add_child(Metadata::with_content(
                    "FilePath",
                    path.display().to_string(),
                ));
            }
            if let Some(thumb) = &self.thumbnail {
                data.add_child(Metadata::with_content("Thumbnail", BASE64.encode(thumb)));
            }
            doc.add_child(data);
        }

        if let Some(sig) = &self.signature {
            let mut elem = Metadata::with_content(SIGNATURE_TAG, BASE64.encode(sig));
            if let Some(signee) = &self.signee {
                elem.set_parameter("signee", signee);
            }
            doc.add_child(elem);
        }

        for ext in &self.extensions {
            doc.add_child(ext.clone());
        }

        doc
    }

    pub fn metadata_bytes(&self) -> Result<Vec<u8>> {
        self.to_metadata().to_xml()
    }

    /// The id rule. Folds in each attribute in sorted order as
    /// `name || value || weight (big-endian u32)`, then the payload hash if
    /// known, else the file name and native-width length. The create time is
    /// deliberately not mixed in, for id compatibility with old nodes.
    fn calculate_id(&self) -> DataObjectId {
        let mut hasher = Sha1::new();
        for attr in &self.attributes {
            hasher.update(attr.name().as_bytes());
            hasher.update(attr.value().as_bytes());
            hasher.update(attr.weight().to_be_bytes());
        }
        if let Some(hash) = &self.data_hash {
            hasher.update(hash);
        } else if let (Some(name), true) = (&self.file_name, self.data_len > 0) {
            hasher.update(name.as_bytes());
            hasher.update((self.data_len as usize).to_ne_bytes());
        }
        hasher.finalize().into()
    }

    pub fn into_ref(self) -> DataObjectRef {
        Arc::new(self)
    }

    pub fn id(&self) -> &DataObjectId {
        &self.id
    }

    pub fn id_str(&self) -> String {
        hex::encode(self.id)
    }

    pub fn id_base64(&self) -> String {
        BASE64.encode(self.id)
    }

    pub fn attributes(&self) -> &AttributeSet {
        &self.attributes
    }

    pub fn get_attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get_by_name(name)
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn create_time(&self) -> Option<Timestamp> {
        self.create_time
    }

    pub fn has_payload(&self) -> bool {
        self.data_len > 0 || self.file_name.is_some()
    }

    pub fn data_len(&self) -> u64 {
        self.data_len
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn data_hash(&self) -> Option<&[u8; DATAOBJECT_ID_LEN]> {
        self.data_hash.as_ref()
    }

    pub fn thumbnail(&self) -> Option<&[u8]> {
        self.thumbnail.as_deref()
    }

    pub fn signature_status(&self) -> SignatureStatus {
        self.signature_status
    }

    pub fn signee(&self) -> Option<&str> {
        self.signee.as_deref()
    }

    /// A received payload was written to the given local path
    pub fn attach_payload(&mut self, path: PathBuf) {
        self.file_path = Some(path);
        self.owns_payload = true;
    }

    /// Recompute the payload hash from the local file and compare
    pub fn verify_payload(&self) -> Result<bool> {
        let (Some(path), Some(expected)) = (&self.file_path, &self.data_hash) else {
            return Ok(false);
        };
        Ok(&hash_file(path)? == expected)
    }

    /// First extension element with the given tag (e.g. `Node`)
    pub fn extension(&self, name: &str) -> Option<&Metadata> {
        self.extensions.iter().find(|m| m.name() == name)
    }

    pub fn add_extension(&mut self, ext: Metadata) {
        self.extensions.push(ext);
    }

    /// True if this object carries a node description
    pub fn is_node_description(&self) -> bool {
        self.extension(crate::node::NODE_TAG).is_some()
    }

    pub fn is_stored(&self) -> bool {
        self.dynamic.lock().stored
    }

    pub fn set_stored(&self, stored: bool) {
        self.dynamic.lock().stored = stored;
    }

    pub fn is_duplicate(&self) -> bool {
        self.dynamic.lock().duplicate
    }

    pub fn set_duplicate(&self) {
        self.dynamic.lock().duplicate = true;
    }

    pub fn receive_time(&self) -> Option<Timestamp> {
        self.dynamic.lock().receive_time
    }

    pub fn received_on(&self) -> Option<InterfaceKey> {
        self.dynamic.lock().received_on.clone()
    }

    pub fn set_received(&self, iface: Option<InterfaceKey>) {
        let mut dynamic = self.dynamic.lock();
        dynamic.receive_time = Some(Timestamp::now());
        dynamic.received_on = iface;
    }
}

impl Drop for DataObject {
    fn drop(&mut self) {
        if self.owns_payload && !self.dynamic.lock().stored {
            if let Some(path) = &self.file_path {
                if let Err(e) = std::fs::remove_file(path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::debug!("could not unlink payload {}: {}", path.display(), e);
                    }
                }
            }
        }
    }
}

impl fmt::Display for DataObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dObj[{}]", &self.id_str()[..8])
    }
}

/// Streamed SHA-1 of a file's contents
pub fn hash_file(path: &Path) -> Result<[u8; DATAOBJECT_ID_LEN]> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::Attribute;
    use tempfile::tempdir;

    fn attrs(pairs: &[(&str, &str)]) -> AttributeSet {
        pairs
            .iter()
            .map(|(n, v)| Attribute::new(*n, *v))
            .collect()
    }

    #[test]
    fn test_id_is_deterministic() {
        let a = DataObject::from_attributes(
            attrs(&[("Topic", "weather"), ("City", "Stockholm")]),
            true,
        );
        let b = DataObject::from_attributes(
            attrs(&[("City", "Stockholm"), ("Topic", "weather")]),
            true,
        );
        // Insertion order must not matter; create time must not matter
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_id_depends_on_weight() {
        let a = DataObject::from_attributes(
            [Attribute::with_weight("Topic", "weather", 1)].into_iter().collect(),
            true,
        );
        let b = DataObject::from_attributes(
            [Attribute::with_weight("Topic", "weather", 2)].into_iter().collect(),
            true,
        );
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_id_known_vector() {
        // SHA1("Topic" "weather" 00 00 00 01) for a single default-weight
        // attribute and no payload
        let dobj =
            DataObject::from_attributes([Attribute::new("Topic", "weather")].into_iter().collect(), true);
        let mut hasher = Sha1::new();
        hasher.update(b"Topicweather");
        hasher.update(1u32.to_be_bytes());
        let expected: [u8; 20] = hasher.finalize().into();
        assert_eq!(dobj.id(), &expected);
    }

    #[test]
    fn test_metadata_roundtrip() {
        let mut dobj = DataObject::from_attributes(
            [
                Attribute::new("Topic", "weather"),
                Attribute::with_weight("City", "Stockholm", 3),
            ]
            .into_iter()
            .collect(),
            true,
        );
        dobj.signee = Some("someone".into());
        dobj.signature = Some(vec![1, 2, 3, 4]);

        let bytes = dobj.metadata_bytes().unwrap();
        let parsed = DataObject::from_metadata_bytes(&bytes).unwrap();
        assert_eq!(parsed.id(), dobj.id());
        assert_eq!(parsed.attributes(), dobj.attributes());
        assert_eq!(parsed.signature_status(), SignatureStatus::Unverified);
        assert_eq!(parsed.signee(), Some("someone"));
    }

    #[test]
    fn test_non_persistent_flag() {
        let dobj = DataObject::from_attributes(attrs(&[("Control", "shutdown")]), false);
        let parsed = DataObject::from_metadata_bytes(&dobj.metadata_bytes().unwrap()).unwrap();
        assert!(!parsed.is_persistent());
    }

    #[test]
    fn test_buffer_publish_spills_and_unlinks() {
        let dir = tempdir().unwrap();
        let dobj =
            DataObject::from_buffer(dir.path(), b"hello world", attrs(&[("Topic", "text")]))
                .unwrap();
        let path = dobj.file_path().unwrap().to_path_buf();
        assert!(path.exists());
        assert_eq!(dobj.data_len(), 11);
        assert!(dobj.verify_payload().unwrap());

        // Not stored: dropping the last reference unlinks the spill file
        drop(dobj);
        assert!(!path.exists());
    }

    #[test]
    fn test_stored_payload_survives_drop() {
        let dir = tempdir().unwrap();
        let dobj =
            DataObject::from_buffer(dir.path(), b"keep me", attrs(&[("Topic", "text")])).unwrap();
        let path = dobj.file_path().unwrap().to_path_buf();
        dobj.set_stored(true);
        drop(dobj);
        assert!(path.exists());
    }

    #[test]
    fn test_file_publish() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("photo.jpg");
        std::fs::write(&path, b"not really a jpeg").unwrap();

        let dobj = DataObject::from_file(&path, attrs(&[("Topic", "photo")])).unwrap();
        assert_eq!(dobj.file_name(), Some("photo.jpg"));
        assert_eq!(dobj.data_len(), 17);
        assert!(dobj.data_hash().is_some());

        // Publishing does not take ownership of the user's file
        drop(dobj);
        assert!(path.exists());
    }

    #[test]
    fn test_payload_hash_changes_id() {
        let dir = tempdir().unwrap();
        let a = DataObject::from_buffer(dir.path(), b"aaa", attrs(&[("T", "x")])).unwrap();
        let b = DataObject::from_buffer(dir.path(), b"bbb", attrs(&[("T", "x")])).unwrap();
        assert_ne!(a.id(), b.id());
    }
}
