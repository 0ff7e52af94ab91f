use assert_matches::assert_matches;

use esgf_harvest::domain::FacetMap;
use esgf_harvest::error::HarvestError;
use esgf_harvest::request::{Request, SEARCH_URL_TEMPLATE, search_url, serialize_facet};

#[test]
fn paginated_url_ends_with_window() {
    let request = Request::new("https://host/esg-search/search?type=Dataset", true, 100).unwrap();
    for offset in [0, 100, 200] {
        let url = request.at_offset(offset).build_url().unwrap();
        assert_eq!(url.matches("limit=").count(), 1);
        assert_eq!(url.matches("offset=").count(), 1);
        assert!(url.ends_with(&format!("&limit=100&offset={offset}")));
    }
}

#[test]
fn caller_limit_kept_without_pagination() {
    let request = Request::new("https://host/search?type=File&limit=5", false, 100).unwrap();
    let url = request.build_url().unwrap();
    assert_eq!(url.matches("limit=").count(), 1);
    assert!(url.contains("limit=5"));
    assert!(url.ends_with("&offset=0"));
}

#[test]
fn caller_limit_with_pagination_is_an_error() {
    let err = Request::new("https://host/search?limit=5", true, 100).unwrap_err();
    assert_matches!(err, HarvestError::UnexpectedLimit(_));
}

#[test]
fn unbound_host_is_rejected() {
    let request = Request::new(SEARCH_URL_TEMPLATE, true, 10).unwrap();
    assert_matches!(request.build_url(), Err(HarvestError::UnresolvedHost(_)));

    let url = request.bind_host("index.example.org").build_url().unwrap();
    assert!(url.starts_with("https://index.example.org/esg-search/search?"));
}

#[test]
fn long_url_is_rejected() {
    let values = (0..400).map(|index| format!("var{index}")).collect::<Vec<_>>();
    let facets = FacetMap::from([("variable".to_string(), values)]);
    let request = Request::new(search_url("https://host/search?type=File", &facets), true, 10).unwrap();
    assert_matches!(
        request.build_url(),
        Err(HarvestError::UrlTooLong { max: 3500, length }) if length > 3500
    );
}

#[test]
fn facets_serialize_as_repeated_pairs() {
    let values = vec!["tas".to_string(), "pr".to_string()];
    assert_eq!(serialize_facet("variable", &values), "&variable=tas&variable=pr");
    assert_eq!(serialize_facet("variable", &[]), "");
}

#[test]
fn caller_offset_with_pagination_is_an_error() {
    let err = Request::new("https://h/search?type=File&offset=5", true, 10).unwrap_err();
    assert_matches!(err, HarvestError::UnexpectedLimit(_));
}

#[test]
fn caller_window_kept_without_pagination() {
    let request = Request::new("https://h/search?type=File&offset=5", false, 10).unwrap();
    let url = request.build_url().unwrap();
    assert_eq!(url, "https://h/search?type=File&offset=5&limit=10");
    assert_eq!(url.matches("offset=").count(), 1);
}
