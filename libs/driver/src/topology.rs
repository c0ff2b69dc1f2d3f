//! Platform topology.
//!
//! A [`Topology`] is the declarative parent → children mapping of a platform
//! network, either supplied in configuration or discovered from the network.
//! Resolving it from a root platform yields a [`PlatformNode`] tree.
//!
//! Resolution rejects cycles and platforms that appear more than once, so a
//! resolved tree is always connected, acyclic and free of duplicate ids.

use std::collections::{BTreeMap, BTreeSet};

use platnet_id::PlatformId;
use serde::{Deserialize, Serialize};

use crate::error::{DriverError, Result};

/// Identity of the device backing a platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
}

/// Data stream configuration of a platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub stream_name: String,

    /// Parameters carried on the stream.
    #[serde(default)]
    pub parameters: Vec<String>,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub options: serde_json::Map<String, serde_json::Value>,
}

/// Device identity per platform.
pub type DeviceMap = BTreeMap<PlatformId, DeviceIdentity>;

/// Stream configuration per platform.
pub type StreamConfigMap = BTreeMap<PlatformId, StreamConfig>;

/// Declarative platform topology: each platform id mapped to its
/// sub-platform ids.
///
/// Serializes as a plain map, e.g. `{"P1": ["P1a", "P1b"]}`. Platforms that
/// only appear as children are leaves.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topology {
    children: BTreeMap<PlatformId, Vec<PlatformId>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a topology from `(platform, children)` pairs.
    pub fn from_children<I, C>(entries: I) -> Self
    where
        I: IntoIterator<Item = (PlatformId, C)>,
        C: IntoIterator<Item = PlatformId>,
    {
        let children = entries
            .into_iter()
            .map(|(id, kids)| (id, kids.into_iter().collect()))
            .collect();
        Self { children }
    }

    /// Declares the children of `platform_id`, replacing any previous entry.
    pub fn insert(&mut self, platform_id: PlatformId, children: Vec<PlatformId>) {
        self.children.insert(platform_id, children);
    }

    #[must_use]
    pub fn with_platform(mut self, platform_id: PlatformId, children: Vec<PlatformId>) -> Self {
        self.insert(platform_id, children);
        self
    }

    /// Declared children of `platform_id`; empty for leaves and unknown ids.
    pub fn children_of(&self, platform_id: &PlatformId) -> &[PlatformId] {
        self.children
            .get(platform_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The topology rooted at `platform_id`: its declaration and those of
    /// all its descendants.
    ///
    /// Fails like [`Topology::resolve`] on cycles, duplicates or an unknown
    /// root.
    pub fn subtree(&self, platform_id: &PlatformId) -> Result<Topology> {
        self.resolve(platform_id, None, None)
            .map(|node| node.to_topology())
    }

    /// Returns true if `platform_id` is declared or referenced as a child.
    pub fn contains(&self, platform_id: &PlatformId) -> bool {
        self.children.contains_key(platform_id)
            || self.children.values().any(|kids| kids.contains(platform_id))
    }

    /// Every platform id mentioned in the topology.
    pub fn platform_ids(&self) -> BTreeSet<PlatformId> {
        self.children
            .iter()
            .flat_map(|(id, kids)| std::iter::once(id).chain(kids))
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Parses a TOML document of the form `P1 = ["P1a", "P1b"]`.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| DriverError::InvalidTopology(e.to_string()))
    }

    /// Parses a JSON document of the form `{"P1": ["P1a", "P1b"]}`.
    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| DriverError::InvalidTopology(e.to_string()))
    }

    /// Resolves the tree rooted at `root`, attaching device identities and
    /// stream configurations from the optional maps.
    ///
    /// Declarations not reachable from `root` are ignored.
    pub fn resolve(
        &self,
        root: &PlatformId,
        devices: Option<&DeviceMap>,
        streams: Option<&StreamConfigMap>,
    ) -> Result<PlatformNode> {
        if !self.contains(root) {
            return Err(DriverError::InvalidTopology(format!(
                "root platform {root} is not part of the topology"
            )));
        }

        Resolver {
            topology: self,
            devices,
            streams,
            on_path: BTreeSet::new(),
            seen: BTreeSet::new(),
        }
        .build(root)
    }
}

struct Resolver<'a> {
    topology: &'a Topology,
    devices: Option<&'a DeviceMap>,
    streams: Option<&'a StreamConfigMap>,
    on_path: BTreeSet<PlatformId>,
    seen: BTreeSet<PlatformId>,
}

/// A platform whose children are still being resolved.
struct Frame<'a> {
    platform_id: PlatformId,
    pending: std::slice::Iter<'a, PlatformId>,
    subplatforms: BTreeMap<PlatformId, PlatformNode>,
}

impl<'a> Resolver<'a> {
    /// Depth-first build with an explicit stack, so deep chains cannot
    /// exhaust the thread stack.
    fn build(mut self, root: &PlatformId) -> Result<PlatformNode> {
        let mut frames: Vec<Frame<'a>> = Vec::new();
        self.enter(&mut frames, root)?;

        while let Some(frame) = frames.last_mut() {
            if let Some(child) = frame.pending.next() {
                self.enter(&mut frames, child)?;
                continue;
            }

            let Some(frame) = frames.pop() else { break };
            self.on_path.remove(&frame.platform_id);
            let parent = frames.last_mut();
            let node = PlatformNode {
                parent_id: parent.as_ref().map(|p| p.platform_id.clone()),
                device: self.devices.and_then(|m| m.get(&frame.platform_id)).cloned(),
                stream_config: self.streams.and_then(|m| m.get(&frame.platform_id)).cloned(),
                subplatforms: frame.subplatforms,
                platform_id: frame.platform_id,
            };
            match parent {
                Some(parent) => {
                    parent.subplatforms.insert(node.platform_id.clone(), node);
                }
                None => return Ok(node),
            }
        }

        unreachable!("the root frame returns the tree when popped")
    }

    fn enter(&mut self, frames: &mut Vec<Frame<'a>>, platform_id: &PlatformId) -> Result<()> {
        if self.on_path.contains(platform_id) {
            let cycle: Vec<&str> = frames
                .iter()
                .map(|frame| frame.platform_id.as_str())
                .skip_while(|id| *id != platform_id.as_str())
                .chain(std::iter::once(platform_id.as_str()))
                .collect();
            return Err(DriverError::InvalidTopology(format!(
                "cycle detected: {}",
                cycle.join(" -> ")
            )));
        }

        if !self.seen.insert(platform_id.clone()) {
            return Err(DriverError::InvalidTopology(format!(
                "platform {platform_id} appears more than once"
            )));
        }

        self.on_path.insert(platform_id.clone());
        frames.push(Frame {
            platform_id: platform_id.clone(),
            pending: self.topology.children_of(platform_id).iter(),
            subplatforms: BTreeMap::new(),
        });
        Ok(())
    }
}

/// A resolved platform in the tree.
///
/// A node exclusively owns its sub-platform nodes. The parent is recorded by
/// id only, for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformNode {
    platform_id: PlatformId,
    parent_id: Option<PlatformId>,
    subplatforms: BTreeMap<PlatformId, PlatformNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device: Option<DeviceIdentity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_config: Option<StreamConfig>,
}

impl PlatformNode {
    pub fn platform_id(&self) -> &PlatformId {
        &self.platform_id
    }

    pub fn parent_id(&self) -> Option<&PlatformId> {
        self.parent_id.as_ref()
    }

    pub fn subplatforms(&self) -> &BTreeMap<PlatformId, PlatformNode> {
        &self.subplatforms
    }

    /// Ids of the direct sub-platforms.
    pub fn subplatform_ids(&self) -> BTreeSet<PlatformId> {
        self.subplatforms.keys().cloned().collect()
    }

    pub fn device(&self) -> Option<&DeviceIdentity> {
        self.device.as_ref()
    }

    pub fn stream_config(&self) -> Option<&StreamConfig> {
        self.stream_config.as_ref()
    }

    pub fn is_leaf(&self) -> bool {
        self.subplatforms.is_empty()
    }

    /// Finds this node or a descendant by id.
    pub fn find(&self, platform_id: &PlatformId) -> Option<&PlatformNode> {
        self.iter().find(|node| &node.platform_id == platform_id)
    }

    /// Depth-first, pre-order traversal starting at this node.
    pub fn iter(&self) -> impl Iterator<Item = &PlatformNode> {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let node = stack.pop()?;
            stack.extend(node.subplatforms.values().rev());
            Some(node)
        })
    }

    /// Number of nodes in this subtree, this node included.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Height of the subtree; 0 for a leaf.
    pub fn depth(&self) -> usize {
        let mut deepest = 0;
        let mut stack = vec![(self, 0)];
        while let Some((node, depth)) = stack.pop() {
            deepest = deepest.max(depth);
            stack.extend(node.subplatforms.values().map(|child| (child, depth + 1)));
        }
        deepest
    }

    /// Rebuilds the declarative topology of this subtree.
    pub fn to_topology(&self) -> Topology {
        Topology::from_children(
            self.iter()
                .map(|node| (node.platform_id.clone(), node.subplatforms.keys().cloned())),
        )
    }
}

impl Drop for PlatformNode {
    // Flattens the subtree so dropping a deep chain does not recurse.
    fn drop(&mut self) {
        let mut stack: Vec<PlatformNode> = std::mem::take(&mut self.subplatforms)
            .into_values()
            .collect();
        while let Some(mut node) = stack.pop() {
            stack.extend(std::mem::take(&mut node.subplatforms).into_values());
        }
    }
}
