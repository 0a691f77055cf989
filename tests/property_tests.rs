//! Property-style checks over the pure helpers and cache orderings.

use portal::glob_cache::GlobCache;
use portal::prefix_map::PrefixMap;
use portal::util;
use proptest::prelude::*;

proptest! {
    #[test]
    fn prop_etag_is_deterministic(body: Vec<u8>) {
        let a = util::etag(&body);
        let b = util::etag(&body);
        prop_assert_eq!(&a, &b);
        prop_assert!(a.starts_with("W/\""));
        prop_assert!(a.ends_with('"'));
    }

    #[test]
    fn prop_slicer_stays_in_bounds(
        offset in 0usize..10_000,
        limit in 0usize..10_000,
        max in 0usize..10_000,
    ) {
        let (left, right) = util::slicer(offset, limit, max, 200);
        prop_assert!(left <= right);
        prop_assert!(right <= max);
        prop_assert!(right - left <= 200);
    }

    #[test]
    fn prop_split_uri_recombines(path in "[a-z/]{0,20}", query in "[a-z=&]{0,20}") {
        let uri = if query.is_empty() { path.clone() } else { format!("{}?{}", path, query) };
        let (p, q) = util::split_uri(&uri);
        prop_assert_eq!(p, path.as_str());
        if !query.is_empty() {
            prop_assert_eq!(q, query.as_str());
        }
    }

    #[test]
    fn prop_compare_version_is_consistent(
        a in "[0-9]{1,3}(\\.[0-9]{1,3}){0,2}",
        b in "[0-9]{1,3}(\\.[0-9]{1,3}){0,2}",
    ) {
        prop_assert_eq!(util::compare_version(&a, &a), 0);
        prop_assert_eq!(util::compare_version(&a, &b), -util::compare_version(&b, &a));
    }

    #[test]
    fn prop_prefix_map_strips_by_segment(
        segments in prop::collection::vec("[a-z]{1,5}", 1..5),
        extra in prop::collection::vec("[a-z]{1,5}", 0..3),
    ) {
        let map = PrefixMap::new();
        let prefix = format!("http://h/{}", segments.join("/"));
        map.set(&prefix, 7usize);

        let mut probe = prefix.clone();
        for seg in &extra {
            probe.push('/');
            probe.push_str(seg);
        }
        prop_assert_eq!(map.get(&probe), Some(7usize));

        // A sibling path that diverges in the first segment never matches.
        let miss = format!("http://h/zzzzzz{}", segments.join("/"));
        prop_assert_eq!(map.get(&miss), None);
    }

    #[test]
    fn prop_glob_update_keeps_lists_deduped(
        uris in prop::collection::vec("[a-c]{1,2}", 0..6),
        updated in "[a-c]{1,2}",
    ) {
        let glob = GlobCache::new(1024 * 1024, 300);
        let pattern = "^u:";
        let mut seed: Vec<String> = uris.iter().map(|u| format!("u:{}", u)).collect();
        seed.sort();
        seed.dedup();
        glob.set(true, pattern, seed.clone());
        glob.set(false, pattern, seed);

        let updated = format!("u:{}", updated);
        glob.update_to_list(&updated);

        let desc = glob.get(true, pattern).unwrap();
        let asc = glob.get(false, pattern).unwrap();

        // The member moved to the head of desc and the tail of asc.
        prop_assert_eq!(desc.first(), Some(&updated));
        prop_assert_eq!(asc.last(), Some(&updated));

        // No duplicates in either ordering.
        for list in [&desc, &asc] {
            let mut seen = std::collections::HashSet::new();
            for uri in list.iter() {
                prop_assert!(seen.insert(uri.clone()));
            }
        }
    }
}
