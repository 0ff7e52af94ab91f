use assert_matches::assert_matches;

use esgf_harvest::domain::FacetMap;
use esgf_harvest::error::HarvestError;
use esgf_harvest::selection::SelectionTree;

fn facets(pairs: &[(&str, &[&str])]) -> FacetMap {
    pairs
        .iter()
        .map(|(key, values)| {
            (
                key.to_string(),
                values.iter().map(|value| value.to_string()).collect(),
            )
        })
        .collect()
}

#[test]
fn merge_is_the_same_from_any_node() {
    let mut tree = SelectionTree::new();
    let root = tree.add_root(facets(&[("project", &["CMIP5"])]));
    let middle = tree.add_child(root, facets(&[("experiment", &["historical"])])).unwrap();
    let leaf = tree.add_child(middle, facets(&[("variable", &["tas"])])).unwrap();
    tree.add_child(root, facets(&[("variable", &["pr"])])).unwrap();

    let from_root = tree.merge_facets(root);
    assert_eq!(tree.merge_facets(middle), from_root);
    assert_eq!(tree.merge_facets(leaf), from_root);
    assert_eq!(tree.root(leaf), root);
}

#[test]
fn merge_is_idempotent_and_leaves_tree_untouched() {
    let mut tree = SelectionTree::new();
    let root = tree.add_root(facets(&[("project", &["CMIP5"])]));
    tree.add_child(root, facets(&[("variable", &["tas"])])).unwrap();

    let first = tree.merge_facets(root);
    let second = tree.merge_facets(root);
    assert_eq!(first, second);
    assert_eq!(tree.get(root).unwrap().facets, facets(&[("project", &["CMIP5"])]));
}

#[test]
fn one_group_per_leaf_with_inherited_facets() {
    let mut tree = SelectionTree::new();
    let root = tree.add_root(facets(&[("project", &["CMIP5"]), ("realm", &["ocean"])]));
    let atmos = tree.add_child(root, facets(&[("realm", &["atmos"])])).unwrap();
    tree.add_child(atmos, facets(&[("variable", &["tas"])])).unwrap();
    tree.add_child(atmos, facets(&[("variable", &["psl"])])).unwrap();
    tree.add_child(root, facets(&[("variable", &["tos"])])).unwrap();

    let merged = tree.merge_facets(root);
    assert_eq!(
        merged,
        vec![
            facets(&[("project", &["CMIP5"]), ("realm", &["atmos"]), ("variable", &["tas"])]),
            facets(&[("project", &["CMIP5"]), ("realm", &["atmos"]), ("variable", &["psl"])]),
            facets(&[("project", &["CMIP5"]), ("realm", &["ocean"]), ("variable", &["tos"])]),
        ]
    );
}

#[test]
fn selection_file_nests_under_default() {
    let mut tree = SelectionTree::new();
    let default = tree
        .load_selection(None, Some("default.txt"), "project=CMIP5\ndistrib=false\n")
        .unwrap();
    let user = tree
        .load_selection(Some(default), Some("user.txt"), "distrib=true\nvariable=tas,pr\n")
        .unwrap();

    assert_eq!(tree.get(user).unwrap().parent(), Some(default));
    let merged = tree.merge_facets(user);
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0]["project"], vec!["CMIP5"]);
    assert_eq!(merged[0]["distrib"], vec!["true"]);
    assert_eq!(merged[0]["variable"], vec!["tas", "pr"]);
}

#[test]
fn line_without_equals_is_rejected() {
    let mut tree = SelectionTree::new();
    assert!(tree.load_selection(None, None, "project CMIP5\n").is_err());
}

#[test]
fn foreign_ids_are_refused() {
    let mut other = SelectionTree::new();
    other.add_root(facets(&[("project", &["CMIP5"])]));
    let foreign = other.add_root(facets(&[("project", &["CMIP6"])]));

    let mut tree = SelectionTree::new();
    tree.add_root(facets(&[("project", &["CORDEX"])]));

    assert!(tree.get(foreign).is_none());
    assert!(tree.merge_facets(foreign).is_empty());
    assert_matches!(
        tree.add_child(foreign, FacetMap::new()),
        Err(HarvestError::UnknownSelection(1))
    );
    assert_eq!(tree.len(), 1);
}
