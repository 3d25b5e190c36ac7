use std::collections::HashMap;

use tracing::warn;

use crate::provider::InstanceTypeSpec;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The CRI annotation carrying the sandbox (pod) name.
pub const SANDBOX_NAME: &str = "io.kubernetes.cri.sandbox-name";

/// The CRI annotation carrying the sandbox (pod) namespace.
pub const SANDBOX_NAMESPACE: &str = "io.kubernetes.cri.sandbox-namespace";

/// The hypervisor annotation repurposed to request a cloud instance type.
pub const MACHINE_TYPE: &str = "io.katacontainers.config.hypervisor.machine_type";

/// The hypervisor annotation requesting a number of vCPUs.
pub const DEFAULT_VCPUS: &str = "io.katacontainers.config.hypervisor.default_vcpus";

/// The hypervisor annotation requesting an amount of memory in MiB.
pub const DEFAULT_MEMORY: &str = "io.katacontainers.config.hypervisor.default_memory";

/// The hypervisor annotation requesting a number of GPUs.
pub const DEFAULT_GPUS: &str = "io.katacontainers.config.hypervisor.default_gpus";

/// The hypervisor annotation repurposed to request a pod VM image.
pub const IMAGE_PATH: &str = "io.katacontainers.config.hypervisor.image";

/// The hypervisor annotation carrying a pod's raw initdata document.
pub const INITDATA: &str = "io.katacontainers.config.hypervisor.cc_init_data";

/// The prefix of every pod VM instance name.
pub const INSTANCE_NAME_PREFIX: &str = "podvm";

/// The longest instance name most providers accept.
pub const INSTANCE_NAME_MAX: usize = 63;

/// How many characters of the sandbox id end an instance name.
const SANDBOX_ID_SUFFIX_LEN: usize = 8;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The pod name of a sandbox.
///
/// CRI-O reports sandbox names as `k8s_<pod>_<namespace>_<uid>_<attempt>`; the pod part is
/// extracted from those.
pub fn pod_name(annotations: &HashMap<String, String>) -> Option<String> {
    let sandbox_name = annotations.get(SANDBOX_NAME)?;
    let mut parts = sandbox_name.split('_');
    let name = match (parts.next(), parts.next()) {
        (Some("k8s"), Some(pod)) => pod,
        _ => sandbox_name.as_str(),
    };
    (!name.is_empty()).then(|| name.to_string())
}

/// The pod namespace of a sandbox.
pub fn pod_namespace(annotations: &HashMap<String, String>) -> Option<String> {
    annotations
        .get(SANDBOX_NAMESPACE)
        .filter(|ns| !ns.is_empty())
        .cloned()
}

/// The pod VM resources requested through annotations. Missing or malformed values are zero.
pub fn instance_type_spec(annotations: &HashMap<String, String>) -> InstanceTypeSpec {
    InstanceTypeSpec::builder()
        .instance_type(annotations.get(MACHINE_TYPE).cloned().unwrap_or_default())
        .vcpus(numeric(annotations, DEFAULT_VCPUS))
        .memory(numeric(annotations, DEFAULT_MEMORY))
        .gpus(numeric(annotations, DEFAULT_GPUS))
        .image(annotations.get(IMAGE_PATH).cloned().unwrap_or_default())
        .build()
}

/// The raw initdata document a pod carries, if any.
pub fn initdata(annotations: &HashMap<String, String>) -> Option<&str> {
    annotations
        .get(INITDATA)
        .map(String::as_str)
        .filter(|data| !data.is_empty())
}

/// Derives the instance name of a pod VM: `podvm-<pod>-<sandbox id prefix>`.
///
/// Characters outside `[a-z0-9-]` become `-` and the pod part is shortened so the name fits in
/// `max` characters. A `max` of zero means unlimited.
pub fn instance_name(pod_name: &str, sandbox_id: &str, max: usize) -> String {
    let pod = sanitize(pod_name);
    let sandbox: String = sanitize(sandbox_id)
        .chars()
        .take(SANDBOX_ID_SUFFIX_LEN)
        .collect();

    let fixed = INSTANCE_NAME_PREFIX.len() + 2 + SANDBOX_ID_SUFFIX_LEN;
    let pod_len = if max > 0 {
        pod.len().min(max.saturating_sub(fixed))
    } else {
        pod.len()
    };

    format!("{INSTANCE_NAME_PREFIX}-{}-{sandbox}", &pod[..pod_len])
}

fn sanitize(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' => c,
            _ => '-',
        })
        .collect()
}

fn numeric(annotations: &HashMap<String, String>, key: &str) -> i64 {
    let Some(value) = annotations.get(key) else {
        return 0;
    };
    value.trim().parse().unwrap_or_else(|e| {
        warn!(annotation = key, %value, error = %e, "ignoring malformed annotation");
        0
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_pod_name_and_namespace() {
        let containerd = annotations(&[(SANDBOX_NAME, "nginx"), (SANDBOX_NAMESPACE, "default")]);
        assert_eq!(pod_name(&containerd).as_deref(), Some("nginx"));
        assert_eq!(pod_namespace(&containerd).as_deref(), Some("default"));

        let crio = annotations(&[(SANDBOX_NAME, "k8s_nginx_default_1234-abcd_0")]);
        assert_eq!(pod_name(&crio).as_deref(), Some("nginx"));
        assert_eq!(pod_namespace(&crio), None);

        assert_eq!(pod_name(&annotations(&[(SANDBOX_NAME, "")])), None);
        assert_eq!(pod_name(&HashMap::new()), None);
    }

    #[test]
    fn test_instance_type_spec_from_annotations() {
        let spec = instance_type_spec(&annotations(&[
            (MACHINE_TYPE, "t3.small"),
            (DEFAULT_VCPUS, "2"),
            (DEFAULT_MEMORY, "4096"),
            (DEFAULT_GPUS, "many"),
            (IMAGE_PATH, "podvm-image"),
        ]));
        assert_eq!(spec.instance_type, "t3.small");
        assert_eq!(spec.vcpus, 2);
        assert_eq!(spec.memory, 4096);
        assert_eq!(spec.gpus, 0);
        assert_eq!(spec.image, "podvm-image");

        assert_eq!(instance_type_spec(&HashMap::new()), InstanceTypeSpec::default());
    }

    #[test]
    fn test_instance_name() {
        assert_eq!(
            instance_name("nginx_Pod.1", "0123456789abcdef", INSTANCE_NAME_MAX),
            "podvm-nginx-pod-1-01234567"
        );

        let long = "a".repeat(100);
        let name = instance_name(&long, "0123456789abcdef", INSTANCE_NAME_MAX);
        assert_eq!(name.len(), INSTANCE_NAME_MAX);
        assert!(name.ends_with("-01234567"));

        assert_eq!(instance_name(&long, "ab", 0).len(), 6 + 100 + 3);
    }
}
