use serde_yaml::{Mapping, Value};

const PROTO_KEY: &str = "__proto__";

/// Deep-merges `source` into `target`.
///
/// Mappings are merged key by key; sequences and scalars from `source`
/// replace the target value wholesale. A non-mapping `target` is reset to an
/// empty mapping first, and a non-mapping `source` contributes nothing.
pub fn deep_assign(target: &mut Value, source: &Value) {
    if !target.is_mapping() {
        *target = Value::Mapping(Mapping::new());
    }
    let (Value::Mapping(dst), Value::Mapping(src)) = (target, source) else {
        return;
    };
    merge_mappings(dst, src);
}

fn merge_mappings(dst: &mut Mapping, src: &Mapping) {
    for (key, value) in src {
        if key.as_str() == Some(PROTO_KEY) {
            continue;
        }
        if dst.get(key) == Some(value) {
            continue;
        }
        if value.is_mapping() {
            let slot = dst
                .entry(key.clone())
                .or_insert_with(|| Value::Mapping(Mapping::new()));
            deep_assign(slot, value);
        } else {
            dst.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn nested_mappings_merge_field_by_field() {
        let mut target = yaml("dns:\n  enable: false\n  ipv6: true\nmode: rule\n");
        deep_assign(&mut target, &yaml("dns:\n  enable: true\n"));
        assert_eq!(target, yaml("dns:\n  enable: true\n  ipv6: true\nmode: rule\n"));
    }

    #[test]
    fn sequences_are_replaced_not_concatenated() {
        let mut target = yaml("rules: [a, b]\n");
        deep_assign(&mut target, &yaml("rules: [c]\n"));
        assert_eq!(target, yaml("rules: [c]\n"));
    }

    #[test]
    fn proto_keys_are_ignored() {
        let mut target = yaml("a: 1\n");
        deep_assign(&mut target, &yaml("__proto__:\n  polluted: true\nb: 2\n"));
        assert_eq!(target, yaml("a: 1\nb: 2\n"));
    }

    #[test]
    fn scalar_target_becomes_mapping() {
        let mut target = Value::Null;
        deep_assign(&mut target, &yaml("a:\n  b: 1\n"));
        assert_eq!(target, yaml("a:\n  b: 1\n"));
    }

    #[test]
    fn mapping_replaces_scalar_slot() {
        let mut target = yaml("tun: false\n");
        deep_assign(&mut target, &yaml("tun:\n  enable: true\n"));
        assert_eq!(target, yaml("tun:\n  enable: true\n"));
    }

    #[test]
    fn non_mapping_source_is_a_no_op() {
        let mut target = yaml("a: 1\n");
        deep_assign(&mut target, &yaml("[1, 2]"));
        assert_eq!(target, yaml("a: 1\n"));
    }
}
