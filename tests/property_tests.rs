//! Property-based tests for values, flags and recordsets using proptest

use proptest::prelude::*;

use dbaccess::prelude::*;
use dbaccess::Schema;
use dbaccess::core::recordset::FieldDesc;

// ============================================================================
// Value roundtrips
// ============================================================================

proptest! {
    #[test]
    fn test_bool_roundtrip(value in any::<bool>()) {
        let val = Value::from(value);
        prop_assert_eq!(val.as_bool(), Some(value));
        prop_assert!(!val.is_null());
        prop_assert_eq!(val.type_name(), "bool");
    }

    #[test]
    fn test_int_roundtrip(value in any::<i32>()) {
        let val = Value::from(value);
        prop_assert_eq!(val.as_int(), Some(value));
        prop_assert_eq!(val.as_long(), Some(value as i64));
        prop_assert_eq!(val.type_name(), "int");
    }

    #[test]
    fn test_long_roundtrip(value in any::<i64>()) {
        let val = Value::from(value);
        prop_assert_eq!(val.as_long(), Some(value));
        prop_assert_eq!(val.type_name(), "long");
    }

    #[test]
    fn test_double_roundtrip(value in any::<f64>().prop_filter("finite", |v| v.is_finite())) {
        let val = Value::from(value);
        let retrieved = val.as_double().unwrap();
        prop_assert!(retrieved == value || (retrieved - value).abs() < 1e-10);
        prop_assert_eq!(val.type_name(), "double");
    }

    #[test]
    fn test_string_roundtrip(value in ".*") {
        let val = Value::from(value.clone());
        prop_assert_eq!(val.as_str(), Some(value.as_str()));
        prop_assert_eq!(val.as_string(), value);
        prop_assert_eq!(val.type_name(), "string");
    }

    #[test]
    fn test_bytes_roundtrip(value in prop::collection::vec(any::<u8>(), 0..1000)) {
        let val = Value::from(value.clone());
        prop_assert_eq!(val.as_bytes(), Some(value.as_slice()));
        prop_assert_eq!(val.type_name(), "bytes");
    }

    /// Rendering any value to a string never panics
    #[test]
    fn test_as_string_never_panics(value in prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        any::<f64>().prop_filter("finite", |v| v.is_finite()).prop_map(Value::from),
        ".*".prop_map(Value::from),
        any::<i64>().prop_map(Value::Timestamp),
    ]) {
        let _ = value.as_string();
    }

    /// Option maps to null exactly when absent
    #[test]
    fn test_option_conversion(value in any::<Option<i64>>()) {
        let val = Value::from(value);
        prop_assert_eq!(val.is_null(), value.is_none());
    }
}

// ============================================================================
// Command classification
// ============================================================================

proptest! {
    /// Leading whitespace and keyword case never change classification
    #[test]
    fn test_classify_is_case_and_space_insensitive(
        spaces in "[ \t]{0,4}",
        upper in any::<bool>(),
        rest in "[a-z ]{0,20}",
    ) {
        let keyword = if upper { "SELECT" } else { "select" };
        let text = format!("{spaces}{keyword} {rest}");
        let flags = CommandFlags::classify(&text);
        prop_assert!(flags.is_select);
        prop_assert!(!flags.is_ddl);
    }

    #[test]
    fn test_classify_ddl_keywords(
        keyword in prop_oneof![Just("CREATE"), Just("ALTER"), Just("DROP")],
        rest in "[a-z_ ]{1,20}",
    ) {
        let flags = CommandFlags::classify(&format!("{keyword} {rest}"));
        prop_assert!(flags.is_ddl);
        prop_assert!(!flags.is_select);
        prop_assert!(flags.is_batchable);
    }
}

// ============================================================================
// Recordset invariants
// ============================================================================

fn cell_strategy() -> impl Strategy<Value = dbaccess::Value> {
    prop_oneof![
        Just(Value::Null),
        any::<i64>().prop_map(Value::from),
        "[a-zA-Z0-9 ]{0,12}".prop_map(Value::from),
    ]
}

proptest! {
    /// Dumps are deterministic and every line is padded to the same width
    #[test]
    fn test_dump_shape(rows in prop::collection::vec(
        prop::collection::vec(cell_strategy(), 3), 0..8,
    )) {
        let schema = Schema::new(vec![
            FieldDesc::new("a", ValueType::String),
            FieldDesc::new("b", ValueType::Long),
            FieldDesc::new("c", ValueType::String),
        ]);
        let rs = Recordset::from_rows(schema, rows.clone());

        let dump = rs.dump();
        prop_assert_eq!(&dump, &rs.dump());
        // header + separator + one line per row
        prop_assert_eq!(dump.lines().count(), rows.len() + 2);
        let width = dump.lines().next().unwrap().len();
        for line in dump.lines() {
            prop_assert_eq!(line.len(), width);
        }
    }

    /// By-name access agrees with positional access
    #[test]
    fn test_row_access_consistency(rows in prop::collection::vec(
        prop::collection::vec(cell_strategy(), 2), 1..6,
    )) {
        let schema = Schema::new(vec![
            FieldDesc::new("x", ValueType::String),
            FieldDesc::new("y", ValueType::String),
        ]);
        let rs = Recordset::from_rows(schema, rows);
        for row in rs.iter() {
            prop_assert_eq!(row.get("x"), row.at(0));
            prop_assert_eq!(row.get("y"), row.at(1));
            prop_assert_eq!(row.get("z"), None);
        }
    }
}

// ============================================================================
// Cache table vocabulary
// ============================================================================

proptest! {
    /// Only the four vocabulary names resolve; everything else is rejected
    #[test]
    fn test_vocabulary_membership(name in "_?[a-z_]{1,24}") {
        let resolved = CacheTable::from_table_name(&name);
        let in_vocabulary = CacheTable::ALL.iter().any(|t| t.table_name() == name);
        prop_assert_eq!(resolved.is_some(), in_vocabulary);
    }
}

#[test]
fn test_vocabulary_roundtrip() {
    for table in CacheTable::ALL {
        assert_eq!(CacheTable::from_table_name(table.table_name()), Some(table));
    }
}
