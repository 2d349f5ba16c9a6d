//! In-memory matching engine of the data store
//!
//! Attributes are indexed twice: by `(name, value)` for exact lookups and by
//! name alone for wildcard subscriptions. The four ranked queries collapse
//! to set intersections plus weighted counting over these indexes.

use crate::event::PrivateEventId;
use haggle_core::attribute::WEIGHT_NO_MATCH;
use haggle_core::{
    AttributeSet, Bloomfilter, DataObjectId, DataObjectRef, Node, NodeId, NodeType, Timestamp,
    NODE_DESCRIPTION_ATTR,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// A node row as the data store persists it: identity, interests and
/// matching parameters, without any live interface state
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredNode {
    pub id: NodeId,
    pub node_type: NodeType,
    pub name: String,
    pub interests: AttributeSet,
    pub bloomfilter: Bloomfilter,
    pub matching_threshold: u32,
    pub max_dataobjects_per_match: u32,
    pub description_create_time: Option<Timestamp>,
}

impl StoredNode {
    pub fn from_node(node: &Node) -> Self {
        StoredNode {
            id: *node.id(),
            node_type: node.node_type(),
            name: node.name().to_string(),
            interests: node.interests().clone(),
            bloomfilter: node.bloomfilter().clone(),
            matching_threshold: node.matching_threshold(),
            max_dataobjects_per_match: node.max_dataobjects_per_match(),
            description_create_time: node.description_create_time(),
        }
    }

    pub fn to_node(&self) -> Node {
        let mut node = Node::with_id(self.id, self.node_type, self.name.clone());
        node.set_interests(self.interests.clone());
        node.set_bloomfilter(self.bloomfilter.clone());
        node.set_matching_threshold(self.matching_threshold);
        node.set_max_dataobjects_per_match(self.max_dataobjects_per_match);
        node.set_description_create_time(self.description_create_time);
        node
    }
}

/// A registered subscription: fires its private event on matching inserts
#[derive(Clone, Debug)]
pub struct Filter {
    pub attributes: AttributeSet,
    pub event: PrivateEventId,
    /// Minimum matched attribute count for the filter to fire
    pub min_matches: usize,
}

impl Filter {
    pub fn new(attributes: AttributeSet, event: PrivateEventId) -> Self {
        Filter {
            attributes,
            event,
            min_matches: 1,
        }
    }
}

/// Count-based match of a filter against an attribute set
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilterMatch {
    pub count: usize,
    /// `100 * count / |filter|`
    pub ratio: u32,
}

/// `match_filter_to_dataobject` / `match_filter_to_node`: how many filter
/// attributes are covered (wildcards satisfy any value under the name)
pub fn match_filter(filter: &AttributeSet, target: &AttributeSet) -> FilterMatch {
    let count = filter.count_covered_by(target);
    let ratio = if filter.is_empty() {
        0
    } else {
        (100 * count / filter.len()) as u32
    };
    FilterMatch { count, ratio }
}

/// Weight-based match of an interest set against a data object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InterestMatch {
    pub count: usize,
    pub weight: u64,
    pub total_weight: u64,
    /// `100 * weight / total_weight`
    pub ratio: u32,
    /// A matched interest carried the NO_MATCH sentinel weight
    pub disqualified: bool,
}

/// `match_dataobject_to_node` / `match_node_to_dataobject`
pub fn match_interests(interests: &AttributeSet, object_attrs: &AttributeSet) -> InterestMatch {
    let total_weight = interests.total_weight();
    let mut count = 0;
    let mut weight = 0u64;
    let mut disqualified = false;
    for interest in interests {
        if object_attrs.iter().any(|b| interest.covers(b)) {
            if interest.weight() == WEIGHT_NO_MATCH {
                disqualified = true;
                continue;
            }
            count += 1;
            weight += interest.weight() as u64;
        }
    }
    let ratio = if total_weight == 0 {
        0
    } else {
        (100 * weight / total_weight) as u32
    };
    InterestMatch {
        count,
        weight,
        total_weight,
        ratio,
        disqualified,
    }
}

/// Outcome of inserting a data object
pub enum InsertOutcome {
    /// Stored; an older description of the same node may have been displaced
    Fresh {
        displaced: Option<DataObjectRef>,
    },
    /// Same id already stored; carries the stored copy
    Duplicate(DataObjectRef),
    /// A newer description of the same node is already stored
    ObsoleteDescription,
}

/// Node id advertised by a node-description data object
pub fn description_node_id(dobj: &haggle_core::DataObject) -> Option<NodeId> {
    let from_ext = dobj
        .extension(haggle_core::node::NODE_TAG)
        .and_then(|m| m.parameter("id"))
        .and_then(|b64| BASE64.decode(b64.trim()).ok());
    let bytes = match from_ext {
        Some(b) => b,
        None => {
            let attr = dobj.get_attribute(NODE_DESCRIPTION_ATTR)?;
            BASE64.decode(attr.value().trim()).ok()?
        }
    };
    bytes.as_slice().try_into().ok()
}

/// The attribute-indexed in-memory store
#[derive(Default)]
pub struct MatchingIndex {
    objects: HashMap<DataObjectId, DataObjectRef>,
    by_attr: HashMap<(String, String), HashSet<DataObjectId>>,
    by_name: HashMap<String, HashSet<DataObjectId>>,
    nodes: HashMap<NodeId, StoredNode>,
    filters: HashMap<PrivateEventId, Filter>,
    /// node id -> its stored description object
    descriptions: HashMap<NodeId, DataObjectId>,
}

impl MatchingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn get_object(&self, id: &DataObjectId) -> Option<&DataObjectRef> {
        self.objects.get(id)
    }

    /// Insert with per-id dedup and node-description displacement
    pub fn insert_object(&mut self, dobj: &DataObjectRef) -> InsertOutcome {
        if let Some(stored) = self.objects.get(dobj.id()) {
            return InsertOutcome::Duplicate(stored.clone());
        }

        let mut displaced = None;
        if let Some(node_id) = description_node_id(dobj) {
            if let Some(existing_id) = self.descriptions.get(&node_id).copied() {
                let existing_time = self
                    .objects
                    .get(&existing_id)
                    .and_then(|d| d.create_time());
                if existing_time >= dobj.create_time() {
                    return InsertOutcome::ObsoleteDescription;
                }
                displaced = self.remove_object(&existing_id);
            }
            self.descriptions.insert(node_id, *dobj.id());
        }

        let id = *dobj.id();
        for attr in dobj.attributes() {
            self.by_attr
                .entry((attr.name().to_string(), attr.value().to_string()))
                .or_default()
                .insert(id);
            self.by_name
                .entry(attr.name().to_string())
                .or_default()
                .insert(id);
        }
        self.objects.insert(id, dobj.clone());
        InsertOutcome::Fresh { displaced }
    }

    pub fn remove_object(&mut self, id: &DataObjectId) -> Option<DataObjectRef> {
        let dobj = self.objects.remove(id)?;
        for attr in dobj.attributes() {
            let key = (attr.name().to_string(), attr.value().to_string());
            if let Some(set) = self.by_attr.get_mut(&key) {
                set.remove(id);
                if set.is_empty() {
                    self.by_attr.remove(&key);
                }
            }
            if let Some(set) = self.by_name.get_mut(attr.name()) {
                set.remove(id);
                if set.is_empty() {
                    self.by_name.remove(attr.name());
                }
            }
        }
        self.descriptions.retain(|_, v| v != id);
        Some(dobj)
    }

    /// Candidate objects touching any attribute of a subscription set
    fn candidates(&self, attrs: &AttributeSet) -> HashSet<DataObjectId> {
        let mut out = HashSet::new();
        for attr in attrs {
            let hits = if attr.is_wildcard() {
                self.by_name.get(attr.name())
            } else {
                self.by_attr
                    .get(&(attr.name().to_string(), attr.value().to_string()))
            };
            if let Some(ids) = hits {
                out.extend(ids.iter().copied());
            }
        }
        out
    }

    pub fn add_filter(&mut self, filter: Filter) {
        self.filters.insert(filter.event, filter);
    }

    pub fn remove_filter(&mut self, event: PrivateEventId) -> Option<Filter> {
        self.filters.remove(&event)
    }

    pub fn filter(&self, event: PrivateEventId) -> Option<&Filter> {
        self.filters.get(&event)
    }

    /// Events of every registered filter matching the given object
    pub fn matching_filters(&self, dobj: &DataObjectRef) -> Vec<PrivateEventId> {
        self.filters
            .values()
            .filter(|f| match_filter(&f.attributes, dobj.attributes()).count >= f.min_matches)
            .map(|f| f.event)
            .collect()
    }

    /// True if the object matches at least one registered filter
    pub fn matches_any_filter(&self, dobj: &DataObjectRef) -> bool {
        !self.matching_filters(dobj).is_empty()
    }

    /// `filter_query`: every stored object matching an ad-hoc filter
    pub fn filter_query(&self, attributes: &AttributeSet, min_matches: usize) -> Vec<DataObjectRef> {
        let mut hits: Vec<&DataObjectRef> = self
            .candidates(attributes)
            .into_iter()
            .filter_map(|id| self.objects.get(&id))
            .filter(|d| match_filter(attributes, d.attributes()).count >= min_matches)
            .collect();
        hits.sort_by(|a, b| b.create_time().cmp(&a.create_time()));
        hits.into_iter().cloned().collect()
    }

    /// `dataobject_query`: ranked candidates for a node, excluding objects
    /// its bloom filter already has and its own node description
    pub fn data_object_query(&self, node: &StoredNode, attr_match_min: usize) -> Vec<DataObjectRef> {
        self.query_for(node, node, attr_match_min, node.max_dataobjects_per_match)
    }

    /// `dataobject_for_nodes_query`: repeat the query per delegate, also
    /// excluding what the delegate already has; merged under the primary cap
    pub fn data_objects_for_nodes_query(
        &self,
        node: &StoredNode,
        delegates: &[StoredNode],
        attr_match_min: usize,
    ) -> Vec<DataObjectRef> {
        let cap = node.max_dataobjects_per_match;
        let mut seen: HashSet<DataObjectId> = HashSet::new();
        let mut merged = Vec::new();
        for delegate in delegates {
            for dobj in self.query_for(node, delegate, attr_match_min, cap) {
                if merged.len() >= cap as usize {
                    return merged;
                }
                if seen.insert(*dobj.id()) {
                    merged.push(dobj);
                }
            }
        }
        merged
    }

    fn query_for(
        &self,
        node: &StoredNode,
        exclude: &StoredNode,
        attr_match_min: usize,
        cap: u32,
    ) -> Vec<DataObjectRef> {
        struct Ranked<'a> {
            dobj: &'a DataObjectRef,
            m: InterestMatch,
        }

        let own_description = self.descriptions.get(&node.id).copied();
        let mut hits: Vec<Ranked> = self
            .candidates(&node.interests)
            .into_iter()
            .filter_map(|id| self.objects.get(&id))
            .filter(|d| {
                !node.bloomfilter.contains(d.id())
                    && !exclude.bloomfilter.contains(d.id())
                    && own_description != Some(*d.id())
            })
            .filter_map(|dobj| {
                let m = match_interests(&node.interests, dobj.attributes());
                if m.disqualified || m.count < attr_match_min || m.ratio < node.matching_threshold
                {
                    None
                } else {
                    Some(Ranked { dobj, m })
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.m.ratio
                .cmp(&a.m.ratio)
                .then_with(|| b.m.count.cmp(&a.m.count))
                .then_with(|| b.dobj.create_time().cmp(&a.dobj.create_time()))
        });
        hits.truncate(cap as usize);
        hits.into_iter().map(|r| r.dobj.clone()).collect()
    }

    /// `node_query`: peers and gateways interested in the given object
    pub fn node_query(
        &self,
        dobj: &DataObjectRef,
        max_resp: usize,
        attr_match_min: usize,
        ratio_floor: u32,
    ) -> Vec<StoredNode> {
        let description_of = description_node_id(dobj);
        struct Ranked<'a> {
            node: &'a StoredNode,
            m: InterestMatch,
        }

        let mut hits: Vec<Ranked> = self
            .nodes
            .values()
            .filter(|n| matches!(n.node_type, NodeType::Peer | NodeType::Gateway))
            .filter(|n| description_of != Some(n.id))
            .filter(|n| !n.bloomfilter.contains(dobj.id()))
            .filter_map(|node| {
                let m = match_interests(&node.interests, dobj.attributes());
                if m.disqualified || m.count < attr_match_min || m.ratio < ratio_floor {
                    None
                } else {
                    Some(Ranked { node, m })
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.m.ratio
                .cmp(&a.m.ratio)
                .then_with(|| b.m.count.cmp(&a.m.count))
        });
        hits.truncate(max_resp);
        hits.into_iter().map(|r| r.node.clone()).collect()
    }

    /// Replace a node row; optionally OR the incoming bloom filter with the
    /// stored one first
    pub fn insert_node(&mut self, mut node: StoredNode, merge_bloomfilter: bool) {
        if merge_bloomfilter {
            if let Some(existing) = self.nodes.get(&node.id) {
                if let Err(e) = node.bloomfilter.merge(&existing.bloomfilter) {
                    tracing::debug!("bloomfilter merge for {}: {}", node.name, e);
                }
            }
        }
        self.nodes.insert(node.id, node);
    }

    pub fn get_node(&self, id: &NodeId) -> Option<&StoredNode> {
        self.nodes.get(id)
    }

    pub fn remove_node(&mut self, id: &NodeId) -> Option<StoredNode> {
        self.nodes.remove(id)
    }

    pub fn nodes_by_type(&self, node_type: NodeType) -> Vec<StoredNode> {
        self.nodes
            .values()
            .filter(|n| n.node_type == node_type)
            .cloned()
            .collect()
    }

    /// Delete objects older than `min_age` that match no registered filter,
    /// up to `cap` per sweep. Returns the deleted objects.
    pub fn age_objects(&mut self, min_age: Duration, now: Timestamp, cap: usize) -> Vec<DataObjectRef> {
        let cutoff = now.as_millis().saturating_sub(min_age.as_millis() as u64);
        let victims: Vec<DataObjectId> = self
            .objects
            .values()
            .filter(|d| {
                let stamp = d
                    .receive_time()
                    .or(d.create_time())
                    .unwrap_or(Timestamp(0));
                stamp.as_millis() <= cutoff && !self.matches_any_filter(d)
            })
            .take(cap)
            .map(|d| *d.id())
            .collect();

        victims
            .into_iter()
            .filter_map(|id| self.remove_object(&id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haggle_core::{Attribute, DataObject, WILDCARD_VALUE};

    fn object(pairs: &[(&str, &str)]) -> DataObjectRef {
        let attrs: AttributeSet = pairs.iter().map(|(n, v)| Attribute::new(*n, *v)).collect();
        DataObject::from_attributes(attrs, true).into_ref()
    }

    fn stored_node(name: &str, interests: &[(&str, &str, u32)], threshold: u32) -> StoredNode {
        StoredNode {
            id: {
                let mut id = [0u8; 20];
                id[..name.len().min(20)].copy_from_slice(&name.as_bytes()[..name.len().min(20)]);
                id
            },
            node_type: NodeType::Peer,
            name: name.to_string(),
            interests: interests
                .iter()
                .map(|(n, v, w)| Attribute::with_weight(*n, *v, *w))
                .collect(),
            bloomfilter: Bloomfilter::plain(),
            matching_threshold: threshold,
            max_dataobjects_per_match: 10,
            description_create_time: None,
        }
    }

    #[test]
    fn test_filter_match_ratio() {
        let filter: AttributeSet = [
            Attribute::new("Topic", "weather"),
            Attribute::new("City", "Oslo"),
        ]
        .into_iter()
        .collect();
        let target: AttributeSet = [Attribute::new("Topic", "weather")].into_iter().collect();
        let m = match_filter(&filter, &target);
        assert_eq!(m.count, 1);
        assert_eq!(m.ratio, 50);
    }

    #[test]
    fn test_interest_match_weights() {
        let interests: AttributeSet = [
            Attribute::with_weight("Topic", "weather", 3),
            Attribute::with_weight("City", "Oslo", 1),
        ]
        .into_iter()
        .collect();
        let obj: AttributeSet = [Attribute::new("Topic", "weather")].into_iter().collect();
        let m = match_interests(&interests, &obj);
        assert_eq!(m.count, 1);
        assert_eq!(m.weight, 3);
        assert_eq!(m.total_weight, 4);
        assert_eq!(m.ratio, 75);
        assert!(!m.disqualified);
    }

    #[test]
    fn test_no_match_sentinel_disqualifies() {
        let interests: AttributeSet = [
            Attribute::with_weight("Spam", WILDCARD_VALUE, WEIGHT_NO_MATCH),
            Attribute::with_weight("Topic", "news", 1),
        ]
        .into_iter()
        .collect();
        let obj: AttributeSet = [
            Attribute::new("Spam", "yes"),
            Attribute::new("Topic", "news"),
        ]
        .into_iter()
        .collect();
        assert!(match_interests(&interests, &obj).disqualified);
    }

    #[test]
    fn test_insert_dedup() {
        let mut index = MatchingIndex::new();
        let a = object(&[("Topic", "weather")]);
        let b = object(&[("Topic", "weather")]);
        assert!(matches!(
            index.insert_object(&a),
            InsertOutcome::Fresh { .. }
        ));
        assert!(matches!(
            index.insert_object(&b),
            InsertOutcome::Duplicate(_)
        ));
        assert_eq!(index.object_count(), 1);
    }

    #[test]
    fn test_wildcard_filter_fires() {
        let mut index = MatchingIndex::new();
        let filter_attrs: AttributeSet = [Attribute::new("Topic", WILDCARD_VALUE)]
            .into_iter()
            .collect();
        index.add_filter(Filter::new(filter_attrs, PrivateEventId(101)));

        let sports = object(&[("Topic", "sports")]);
        let oslo = object(&[("City", "Oslo")]);
        assert_eq!(index.matching_filters(&sports), vec![PrivateEventId(101)]);
        assert!(index.matching_filters(&oslo).is_empty());
    }

    #[test]
    fn test_filter_query_replay() {
        let mut index = MatchingIndex::new();
        let red = object(&[("Color", "red")]);
        index.insert_object(&red);
        index.insert_object(&object(&[("Color", "blue")]));

        let attrs: AttributeSet = [Attribute::new("Color", "red")].into_iter().collect();
        let hits = index.filter_query(&attrs, 1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id(), red.id());
    }

    #[test]
    fn test_data_object_query_ranking_and_exclusions() {
        let mut index = MatchingIndex::new();
        let strong = object(&[("Topic", "weather"), ("City", "Oslo")]);
        let weak = object(&[("Topic", "weather")]);
        let seen = object(&[("Topic", "weather"), ("City", "Oslo"), ("Lang", "no")]);
        index.insert_object(&strong);
        index.insert_object(&weak);
        index.insert_object(&seen);

        let mut node = stored_node(
            "n1",
            &[("Topic", "weather", 1), ("City", "Oslo", 1), ("Lang", "no", 1)],
            0,
        );
        node.bloomfilter.add(seen.id());

        let hits = index.data_object_query(&node, 1);
        assert_eq!(hits.len(), 2);
        // Two matched interests outrank one
        assert_eq!(hits[0].id(), strong.id());
        assert_eq!(hits[1].id(), weak.id());
    }

    #[test]
    fn test_query_respects_threshold_and_cap() {
        let mut index = MatchingIndex::new();
        for i in 0..20 {
            index.insert_object(&object(&[("Topic", "weather"), ("Seq", &i.to_string())]));
        }
        let mut node = stored_node("n2", &[("Topic", "weather", 1), ("City", "Oslo", 1)], 60);
        node.max_dataobjects_per_match = 5;

        // 50% weight ratio is below the 60% threshold
        assert!(index.data_object_query(&node, 1).is_empty());

        node.matching_threshold = 50;
        assert_eq!(index.data_object_query(&node, 1).len(), 5);
    }

    #[test]
    fn test_node_query() {
        let mut index = MatchingIndex::new();
        index.insert_node(stored_node("alpha", &[("Topic", "weather", 1)], 0), false);
        index.insert_node(stored_node("beta", &[("Topic", "sports", 1)], 0), false);
        let mut seen_node = stored_node("gamma", &[("Topic", "weather", 1)], 0);
        let dobj = object(&[("Topic", "weather")]);
        seen_node.bloomfilter.add(dobj.id());
        index.insert_node(seen_node, false);

        let hits = index.node_query(&dobj, 10, 1, 0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "alpha");
    }

    #[test]
    fn test_description_displacement() {
        use haggle_core::Metadata;

        let mut index = MatchingIndex::new();
        let node_id = [7u8; 20];
        let make_desc = |create_ms: u64, tag: &str| {
            let attrs: AttributeSet =
                [Attribute::new(NODE_DESCRIPTION_ATTR, BASE64.encode(node_id))]
                    .into_iter()
                    .collect();
            let mut dobj = DataObject::from_attributes(attrs, true);
            let mut node_elem = Metadata::new("Node");
            node_elem.set_parameter("id", BASE64.encode(node_id));
            node_elem.set_parameter("tag", tag);
            dobj.add_extension(node_elem);
            // Rebuild through metadata so create_time participates
            let mut doc = dobj.to_metadata();
            doc.set_parameter("create_time", Timestamp::from_millis(create_ms));
            DataObject::from_metadata(&doc).unwrap().into_ref()
        };

        let old = make_desc(1_000, "old");
        let new = make_desc(2_000, "new");

        assert!(matches!(
            index.insert_object(&old),
            InsertOutcome::Fresh { displaced: None }
        ));
        match index.insert_object(&new) {
            InsertOutcome::Fresh { displaced: Some(d) } => assert_eq!(d.id(), old.id()),
            _ => panic!("new description should displace the old one"),
        }
        // Re-offering the old description is rejected
        let older = make_desc(500, "older");
        assert!(matches!(
            index.insert_object(&older),
            InsertOutcome::ObsoleteDescription
        ));
        assert_eq!(index.object_count(), 1);
    }

    #[test]
    fn test_for_nodes_query_excludes_delegate_holdings() {
        let mut index = MatchingIndex::new();
        let a = object(&[("Topic", "weather"), ("Seq", "a")]);
        let b = object(&[("Topic", "weather"), ("Seq", "b")]);
        index.insert_object(&a);
        index.insert_object(&b);

        let primary = stored_node("primary", &[("Topic", "weather", 1)], 0);
        let mut delegate = stored_node("delegate", &[("Topic", "weather", 1)], 0);
        delegate.bloomfilter.add(a.id());

        // The delegate already carries `a`, so only `b` is worth handing over
        let hits = index.data_objects_for_nodes_query(&primary, &[delegate], 1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id(), b.id());
    }

    #[test]
    fn test_aging_batch_cap_leaves_rest_for_next_sweep() {
        let mut index = MatchingIndex::new();
        let mut newest = Timestamp(0);
        for i in 0..10 {
            let dobj = object(&[("Seq", &i.to_string())]);
            newest = newest.max(dobj.create_time().unwrap());
            index.insert_object(&dobj);
        }
        let now = Timestamp::from_millis(newest.as_millis() + 120_000);
        let first = index.age_objects(Duration::from_secs(60), now, 4);
        assert_eq!(first.len(), 4);
        let second = index.age_objects(Duration::from_secs(60), now, 100);
        assert_eq!(second.len(), 6);
    }

    #[test]
    fn test_aging_is_idempotent() {
        let mut index = MatchingIndex::new();
        let dobj = object(&[("Topic", "old-news")]);
        index.insert_object(&dobj);

        let now = Timestamp::from_millis(dobj.create_time().unwrap().as_millis() + 120_000);
        let first = index.age_objects(Duration::from_secs(60), now, 100);
        assert_eq!(first.len(), 1);
        let second = index.age_objects(Duration::from_secs(60), now, 100);
        assert!(second.is_empty());
    }

    #[test]
    fn test_aging_spares_filter_matches() {
        let mut index = MatchingIndex::new();
        let kept = object(&[("Topic", "weather")]);
        let dropped = object(&[("Topic", "noise")]);
        index.insert_object(&kept);
        index.insert_object(&dropped);
        index.add_filter(Filter::new(
            [Attribute::new("Topic", "weather")].into_iter().collect(),
            PrivateEventId(5),
        ));

        let now = Timestamp::from_millis(kept.create_time().unwrap().as_millis() + 120_000);
        let deleted = index.age_objects(Duration::from_secs(60), now, 100);
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].id(), dropped.id());
        assert!(index.get_object(kept.id()).is_some());
    }

    #[test]
    fn test_bloomfilter_merge_on_node_insert() {
        let mut index = MatchingIndex::new();
        let mut first = stored_node("n", &[("Topic", "weather", 1)], 0);
        first.bloomfilter.add(&[1u8; 20]);
        index.insert_node(first, false);

        let mut second = stored_node("n", &[("Topic", "weather", 1)], 0);
        second.bloomfilter.add(&[2u8; 20]);
        index.insert_node(second, true);

        let merged = index.get_node(&{
            let mut id = [0u8; 20];
            id[..1].copy_from_slice(b"n");
            id
        });
        let merged = merged.unwrap();
        assert!(merged.bloomfilter.contains(&[1u8; 20]));
        assert!(merged.bloomfilter.contains(&[2u8; 20]));
    }
}
