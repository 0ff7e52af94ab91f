//! Nested facet scopes.
//!
//! A selection holds search facets and may contain sub-selections that
//! narrow it down (for instance one sub-selection per realm/frequency group of
//! variables). Selections live in an arena; children are owned by the tree and
//! the parent link is a plain index, so walking up never creates ownership
//! cycles.

use std::sync::LazyLock;

use regex::Regex;

use crate::domain::FacetMap;
use crate::error::HarvestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SelectionId(usize);

#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub facets: FacetMap,
    pub filename: Option<String>,
    parent: Option<SelectionId>,
    children: Vec<SelectionId>,
}

impl Selection {
    pub fn parent(&self) -> Option<SelectionId> {
        self.parent
    }

    pub fn children(&self) -> &[SelectionId] {
        &self.children
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SelectionTree {
    nodes: Vec<Selection>,
}

impl SelectionTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add_root(&mut self, facets: FacetMap) -> SelectionId {
        let id = SelectionId(self.nodes.len());
        self.nodes.push(Selection {
            facets,
            ..Selection::default()
        });
        id
    }

    pub fn add_child(&mut self, parent: SelectionId, facets: FacetMap) -> Result<SelectionId, HarvestError> {
        let id = SelectionId(self.nodes.len());
        self.nodes
            .get_mut(parent.0)
            .ok_or(HarvestError::UnknownSelection(parent.0))?
            .children
            .push(id);
        self.nodes.push(Selection {
            facets,
            parent: Some(parent),
            ..Selection::default()
        });
        Ok(id)
    }

    pub fn get(&self, id: SelectionId) -> Option<&Selection> {
        self.nodes.get(id.0)
    }

    pub fn get_mut(&mut self, id: SelectionId) -> Option<&mut Selection> {
        self.nodes.get_mut(id.0)
    }

    /// Top-level selection of the tree containing `id`.
    pub fn root(&self, id: SelectionId) -> SelectionId {
        let mut current = id;
        // A well-formed tree has at most `len` ancestors.
        for _ in 0..self.nodes.len() {
            match self.get(current).and_then(Selection::parent) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        current
    }

    /// Resolves the whole tree containing `id` into one facet map per leaf.
    ///
    /// Merging always starts at the root, whichever node is passed in. An
    /// id from another tree resolves to nothing.
    pub fn merge_facets(&self, id: SelectionId) -> Vec<FacetMap> {
        if self.get(id).is_none() {
            return Vec::new();
        }
        self.merge_downstream(self.root(id))
    }

    fn merge_downstream(&self, id: SelectionId) -> Vec<FacetMap> {
        let node = &self.nodes[id.0];
        if node.children.is_empty() {
            return vec![node.facets.clone()];
        }

        // Child facets override this node's facets; one output per leaf.
        let mut groups = Vec::new();
        for child in &node.children {
            for group in self.merge_downstream(*child) {
                let mut merged = node.facets.clone();
                merged.extend(group);
                groups.push(merged);
            }
        }
        groups
    }

    /// Loads a selection file under `parent` (or as a new root).
    ///
    /// Lines are `facet=value value2` (commas also separate values). Lines
    /// such as `variable[atmos][mon]=tas psl` become sub-selections carrying
    /// `realm`, `time_frequency` and `variable`; `*` leaves a dimension open.
    pub fn load_selection(
        &mut self,
        parent: Option<SelectionId>,
        filename: Option<&str>,
        content: &str,
    ) -> Result<SelectionId, HarvestError> {
        let mut facets = FacetMap::new();
        let mut groups = Vec::new();
        for line in content.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, values) = line
                .split_once('=')
                .ok_or_else(|| HarvestError::InvalidQuery(line.to_string()))?;
            let key = key.trim();
            let values = split_values(values);

            if let Some(captures) = SUB_SELECTION.captures(key) {
                let mut group = FacetMap::new();
                for (index, facet) in [(2, "realm"), (3, "time_frequency")] {
                    let value = &captures[index];
                    if value != "*" {
                        group.insert(facet.to_string(), vec![value.to_string()]);
                    }
                }
                group.insert(captures[1].to_string(), values);
                groups.push(group);
            } else if key.is_empty() {
                return Err(HarvestError::InvalidQuery(line.to_string()));
            } else {
                facets.entry(key.to_string()).or_default().extend(values);
            }
        }

        let id = match parent {
            Some(parent) => self.add_child(parent, facets)?,
            None => self.add_root(facets),
        };
        if let Some(selection) = self.get_mut(id) {
            selection.filename = filename.map(str::to_string);
        }
        for group in groups {
            self.add_child(id, group)?;
        }
        Ok(id)
    }
}

// `variable[realm][frequency]`
static SUB_SELECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\w+)\[([^\]]+)\]\[([^\]]+)\]$").expect("valid sub-selection pattern")
});

fn split_values(raw: &str) -> Vec<String> {
    raw.split(|ch: char| ch.is_whitespace() || ch == ',')
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}
