use super::*;
use std::collections::BTreeMap;

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: BTreeMap<String, String> = pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn empty_environment_yields_defaults() {
    let settings = Settings::from_lookup(lookup_from(&[])).expect("settings");
    assert_eq!(settings.simulate_error, None);
    assert!(!settings.readonly_cache);
    assert_eq!(settings.csys_ver, UNDEFINED_VERSION);
    assert_eq!(settings.bestrefs_command, DEFAULT_BESTREFS_COMMAND);
    assert_eq!(settings.product_list_url, DEFAULT_PRODUCT_LIST_URL);
    assert_eq!(settings.retry.max_attempts, 3);
}

#[test]
fn simulate_error_and_flags_are_parsed() {
    let settings = Settings::from_lookup(lookup_from(&[
        (SIMULATE_ERROR_VAR, " 23 "),
        (READONLY_CACHE_VAR, "1"),
        (CRDS_CONTEXT_VAR, "hst_1140.pmap"),
        (CSYS_VER_VAR, "caldp_2024"),
        (PRODUCT_LIST_URL_VAR, "http://archive.local/list?id="),
        (RETRY_ATTEMPTS_VAR, "5"),
        (RETRY_MIN_SECONDS_VAR, "0"),
        (RETRY_MAX_SECONDS_VAR, "0.5"),
    ]))
    .expect("settings");
    assert_eq!(settings.simulate_error, Some(23));
    assert!(settings.readonly_cache);
    assert_eq!(settings.crds_context.as_deref(), Some("hst_1140.pmap"));
    assert_eq!(settings.csys_ver, "caldp_2024");
    assert_eq!(settings.product_list_url, "http://archive.local/list?id=");
    assert_eq!(settings.retry.max_attempts, 5);
    assert_eq!(settings.retry.max_delay, Duration::from_millis(500));
}

#[test]
fn zero_or_blank_simulation_is_disabled() {
    for value in ["0", "", "  "] {
        let settings =
            Settings::from_lookup(lookup_from(&[(SIMULATE_ERROR_VAR, value)])).expect("settings");
        assert_eq!(settings.simulate_error, None, "value {value:?}");
    }
}

#[test]
fn malformed_values_are_rejected() {
    assert!(Settings::from_lookup(lookup_from(&[(SIMULATE_ERROR_VAR, "oom")])).is_err());
    assert!(Settings::from_lookup(lookup_from(&[(READONLY_CACHE_VAR, "maybe")])).is_err());
    assert!(Settings::from_lookup(lookup_from(&[(RETRY_ATTEMPTS_VAR, "0")])).is_err());
    assert!(Settings::from_lookup(lookup_from(&[
        (RETRY_MIN_SECONDS_VAR, "10"),
        (RETRY_MAX_SECONDS_VAR, "1"),
    ]))
    .is_err());
}

#[test]
fn environment_snapshot_keeps_job_variables_sorted() {
    let lines = environment_snapshot(vec![
        ("PATH".to_string(), "/bin".to_string()),
        ("CRDS_CONTEXT".to_string(), "hst_1140.pmap".to_string()),
        ("CSYS_VER".to_string(), "v1".to_string()),
        ("CALDP_RETRY_ATTEMPTS".to_string(), "2".to_string()),
    ]);
    assert_eq!(
        lines,
        vec![
            "CALDP_RETRY_ATTEMPTS=2",
            "CRDS_CONTEXT=hst_1140.pmap",
            "CSYS_VER=v1"
        ]
    );
}

#[test]
fn explicit_object_store_root_wins() {
    let settings = Settings::from_lookup(lookup_from(&[(OBJECT_STORE_ROOT_VAR, "/data/buckets")]))
        .expect("settings");
    assert_eq!(
        settings.resolve_object_store_root().expect("root"),
        PathBuf::from("/data/buckets")
    );
}
