//! Request rewrites applied on the way to the in-VM agent.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use base64::{engine::general_purpose::URL_SAFE, Engine};

use crate::{config::DEFAULT_PAUSE_IMAGE, PeerpodResult};

use super::{
    wire::{edit_field, parse_fields, MessageWriter},
    CreateContainerRequest, Storage,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The OCI annotation listing the CSI volume target paths the pod VM must wait for.
pub const VOLUME_TARGET_PATH_KEY: &str = "io.confidentialcontainers.org.peerpodvolumes.target_path";

/// The storage driver used when the guest pulls the image itself.
pub const IMAGE_GUEST_PULL_DRIVER: &str = "image_guest_pull";

/// The containerd annotation carrying the image name.
pub const CRI_IMAGE_NAME: &str = "io.kubernetes.cri.image-name";

/// The containerd annotation carrying the container type.
pub const CRI_CONTAINER_TYPE: &str = "io.kubernetes.cri.container-type";

/// The CRI-O annotation carrying the image name.
pub const CRIO_IMAGE_NAME: &str = "io.kubernetes.cri-o.ImageName";

/// The CRI-O annotation carrying the container type.
pub const CRIO_CONTAINER_TYPE: &str = "io.kubernetes.cri-o.ContainerType";

/// The container type of sandbox (pause) containers.
pub const CONTAINER_TYPE_SANDBOX: &str = "sandbox";

const CSI_VOLUME_PATH_SEGMENT: &str = "/volumes/kubernetes.io~csi/";

const CREATE_SANDBOX_DNS: u32 = 2;
const CREATE_CONTAINER_OCI: u32 = 6;
const OCI_ANNOTATIONS: u32 = 7;
const OCI_LINUX: u32 = 8;
const LINUX_NAMESPACES: u32 = 6;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Whether `source` is the target path of a CSI `NodePublishVolume` call for a direct-assigned
/// volume.
///
/// The path must have the kubelet's CSI volume shape, and the kubelet must have recorded the volume
/// under `direct_volumes_dir` in a directory named by the URL-safe base64 of the path.
pub fn is_node_publish_volume_target_path(source: &str, direct_volumes_dir: &Path) -> bool {
    let cleaned: PathBuf = Path::new(source).components().collect();
    if !cleaned.to_string_lossy().contains(CSI_VOLUME_PATH_SEGMENT) {
        return false;
    }

    direct_volumes_dir
        .join(URL_SAFE.encode(source.as_bytes()))
        .exists()
}

/// The mount sources of `request` that are CSI volume target paths.
pub fn csi_volume_targets(request: &CreateContainerRequest, direct_volumes_dir: &Path) -> Vec<String> {
    request
        .mounts()
        .iter()
        .filter(|m| is_node_publish_volume_target_path(&m.source, direct_volumes_dir))
        .map(|m| m.source.clone())
        .collect()
}

/// Sets an annotation in the OCI spec of an encoded `CreateContainerRequest`.
pub fn set_oci_annotation(payload: &[u8], key: &str, value: &str) -> PeerpodResult<Vec<u8>> {
    edit_field(
        payload,
        CREATE_CONTAINER_OCI,
        |oci| Ok(Some(set_map_entry(oci, OCI_ANNOTATIONS, key, value)?)),
        || Ok(Some(MessageWriter::new().map_entry(OCI_ANNOTATIONS, key, value).finish())),
    )
}

/// Records the CSI volume targets of a `CreateContainerRequest` in [`VOLUME_TARGET_PATH_KEY`],
/// after any targets already listed there.
pub fn annotate_volume_targets(
    payload: &[u8],
    request: &CreateContainerRequest,
    targets: &[String],
) -> PeerpodResult<Vec<u8>> {
    if targets.is_empty() {
        return Ok(payload.to_vec());
    }

    let mut all: Vec<&str> = request
        .annotation(VOLUME_TARGET_PATH_KEY)
        .map(|existing| existing.split(',').filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    all.extend(targets.iter().map(String::as_str));

    set_oci_annotation(payload, VOLUME_TARGET_PATH_KEY, &all.join(","))
}

/// Removes every `dns` entry from an encoded `CreateSandboxRequest`.
pub fn strip_dns(payload: &[u8]) -> PeerpodResult<Vec<u8>> {
    edit_field(payload, CREATE_SANDBOX_DNS, |_| Ok(None), || Ok(None))
}

/// Adds a `network` namespace joining `ns_path` to an encoded `CreateContainerRequest`.
pub fn add_network_namespace(payload: &[u8], ns_path: &Path) -> PeerpodResult<Vec<u8>> {
    let namespace = MessageWriter::new()
        .string(1, "network")
        .string(2, &ns_path.to_string_lossy())
        .finish();
    let linux_with_namespace = || MessageWriter::new().bytes(LINUX_NAMESPACES, &namespace).finish();

    edit_field(
        payload,
        CREATE_CONTAINER_OCI,
        |oci| {
            Ok(Some(edit_field(
                oci,
                OCI_LINUX,
                |linux| {
                    let mut writer = MessageWriter::new();
                    for field in parse_fields(linux)? {
                        writer.copy(&field);
                    }
                    Ok(Some(writer.bytes(LINUX_NAMESPACES, &namespace).finish()))
                },
                || Ok(Some(linux_with_namespace())),
            )?))
        },
        || Ok(Some(MessageWriter::new().bytes(OCI_LINUX, &linux_with_namespace()).finish())),
    )
}

/// Picks the image to pull for a container from its annotations.
///
/// Sandbox containers get `pause_image`, or the default pause image when neither it nor an
/// annotated image is set. The CRI-O annotation wins over the containerd one.
pub fn image_name(annotations: &HashMap<String, String>, pause_image: &str) -> Option<String> {
    let annotated = [CRI_IMAGE_NAME, CRIO_IMAGE_NAME]
        .iter()
        .filter_map(|key| annotations.get(*key))
        .last()
        .filter(|image| !image.is_empty());

    let is_sandbox = [CRI_CONTAINER_TYPE, CRIO_CONTAINER_TYPE]
        .iter()
        .any(|key| annotations.get(*key).map(String::as_str) == Some(CONTAINER_TYPE_SANDBOX));

    if is_sandbox {
        if !pause_image.is_empty() {
            return Some(pause_image.to_string());
        }
        if annotated.is_none() {
            return Some(DEFAULT_PAUSE_IMAGE.to_string());
        }
    }

    annotated.cloned()
}

/// Whether the guest pulls the container image itself.
pub fn pulls_in_guest(storages: &[Storage]) -> bool {
    storages.iter().any(|s| s.driver == IMAGE_GUEST_PULL_DRIVER)
}

/// Rebuilds a `map<string, string>` field with `key` set to `value`.
fn set_map_entry(buf: &[u8], number: u32, key: &str, value: &str) -> PeerpodResult<Vec<u8>> {
    let mut writer = MessageWriter::new();
    for field in parse_fields(buf)? {
        if field.is_bytes(number) {
            let entry = parse_fields(field.value)?;
            let same_key = entry
                .iter()
                .rev()
                .find(|part| part.is_bytes(1))
                .map(|part| part.value == key.as_bytes())
                .unwrap_or(key.is_empty());
            if same_key {
                continue;
            }
        }
        writer.copy(&field);
    }

    Ok(writer.map_entry(number, key, value).finish())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use prost::Message;

    use crate::agent::{wire::repeated_strings, CreateSandboxRequest};

    use super::*;

    fn mount(destination: &str, source: &str) -> Vec<u8> {
        MessageWriter::new()
            .string(1, destination)
            .string(2, source)
            .string(3, "bind")
            .finish()
    }

    /// A `CreateContainerRequest` with an OCI spec carrying `mounts`, one annotation and a process
    /// field the views do not declare.
    fn create_container(mounts: &[(&str, &str)]) -> Vec<u8> {
        let mut oci = MessageWriter::new();
        oci.string(1, "1.0.2").bytes(2, b"\x0a\x03foo");
        for (destination, source) in mounts {
            oci.bytes(5, &mount(destination, source));
        }
        oci.map_entry(7, "io.kubernetes.cri.container-type", "container");

        MessageWriter::new()
            .string(1, "c1")
            .string(2, "exec-1")
            .bytes(6, &oci.finish())
            .finish()
    }

    #[test]
    fn test_is_node_publish_volume_target_path() -> anyhow::Result<()> {
        let direct_volumes = tempfile::tempdir()?;
        let source =
            "/var/lib/kubelet/pods/abc/volumes/kubernetes.io~csi/pvc-123/mount";
        assert!(!is_node_publish_volume_target_path(source, direct_volumes.path()));

        std::fs::create_dir(direct_volumes.path().join(URL_SAFE.encode(source)))?;
        assert!(is_node_publish_volume_target_path(source, direct_volumes.path()));

        let other = "/var/lib/kubelet/pods/abc/volumes/kubernetes.io~empty-dir/cache";
        std::fs::create_dir(direct_volumes.path().join(URL_SAFE.encode(other)))?;
        assert!(!is_node_publish_volume_target_path(other, direct_volumes.path()));
        Ok(())
    }

    #[test]
    fn test_annotate_volume_targets_preserves_unknown_fields() -> anyhow::Result<()> {
        let direct_volumes = tempfile::tempdir()?;
        let csi = "/var/lib/kubelet/pods/abc/volumes/kubernetes.io~csi/pvc-123/mount";
        std::fs::create_dir(direct_volumes.path().join(URL_SAFE.encode(csi)))?;

        let payload = create_container(&[("/etc/hosts", "/run/hosts"), ("/data", csi)]);
        let request = CreateContainerRequest::decode(payload.as_slice())?;
        let targets = csi_volume_targets(&request, direct_volumes.path());
        assert_eq!(targets, vec![csi.to_string()]);

        let rewritten = annotate_volume_targets(&payload, &request, &targets)?;
        let decoded = CreateContainerRequest::decode(rewritten.as_slice())?;
        assert_eq!(decoded.annotation(VOLUME_TARGET_PATH_KEY), Some(csi));
        assert_eq!(decoded.annotation(CRI_CONTAINER_TYPE), Some("container"));
        assert_eq!(decoded.mounts().len(), 2);

        // exec_id and the OCI process field survive the rewrite.
        assert_eq!(repeated_strings(&rewritten, 2)?, vec!["exec-1"]);
        let oci = parse_fields(&rewritten)?
            .into_iter()
            .find(|f| f.number == 6)
            .unwrap();
        assert!(parse_fields(oci.value)?
            .iter()
            .any(|f| f.number == 2 && f.value == b"\x0a\x03foo"));
        Ok(())
    }

    #[test]
    fn test_annotate_volume_targets_appends_to_existing() -> anyhow::Result<()> {
        let payload = set_oci_annotation(&create_container(&[]), VOLUME_TARGET_PATH_KEY, "/a")?;
        let request = CreateContainerRequest::decode(payload.as_slice())?;

        let rewritten = annotate_volume_targets(&payload, &request, &["/b".to_string()])?;
        let decoded = CreateContainerRequest::decode(rewritten.as_slice())?;
        assert_eq!(decoded.annotation(VOLUME_TARGET_PATH_KEY), Some("/a,/b"));
        assert_eq!(decoded.oci.unwrap().annotations.len(), 2);

        let unchanged = annotate_volume_targets(&payload, &request, &[])?;
        assert_eq!(unchanged, payload);
        Ok(())
    }

    #[test]
    fn test_strip_dns() -> anyhow::Result<()> {
        let payload = MessageWriter::new()
            .string(1, "pod-host")
            .string(2, "8.8.8.8")
            .string(2, "1.1.1.1")
            .string(5, "sandbox-1")
            .finish();

        let stripped = strip_dns(&payload)?;
        let request = CreateSandboxRequest::decode(stripped.as_slice())?;
        assert!(request.dns.is_empty());
        assert_eq!(request.hostname, "pod-host");
        assert_eq!(request.sandbox_id, "sandbox-1");
        Ok(())
    }

    #[test]
    fn test_add_network_namespace() -> anyhow::Result<()> {
        let ns = Path::new("/run/netns/podns");

        let without_linux = add_network_namespace(&create_container(&[]), ns)?;
        let request = CreateContainerRequest::decode(without_linux.as_slice())?;
        let namespaces = request.oci.unwrap().linux.unwrap().namespaces;
        assert_eq!(namespaces.len(), 1);
        assert_eq!(namespaces[0].r#type, "network");
        assert_eq!(namespaces[0].path, "/run/netns/podns");

        let twice = add_network_namespace(&without_linux, Path::new("/run/netns/other"))?;
        let request = CreateContainerRequest::decode(twice.as_slice())?;
        let namespaces = request.oci.unwrap().linux.unwrap().namespaces;
        assert_eq!(namespaces.len(), 2);
        assert_eq!(namespaces[1].path, "/run/netns/other");

        let no_oci = add_network_namespace(&MessageWriter::new().string(1, "c1").finish(), ns)?;
        let request = CreateContainerRequest::decode(no_oci.as_slice())?;
        assert_eq!(request.container_id, "c1");
        assert_eq!(request.oci.unwrap().linux.unwrap().namespaces.len(), 1);
        Ok(())
    }

    #[test]
    fn test_image_name() {
        let annotations = |pairs: &[(&str, &str)]| -> HashMap<String, String> {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };

        let container = annotations(&[(CRI_IMAGE_NAME, "docker.io/library/nginx:latest")]);
        assert_eq!(
            image_name(&container, "").as_deref(),
            Some("docker.io/library/nginx:latest")
        );

        let sandbox = annotations(&[(CRI_CONTAINER_TYPE, CONTAINER_TYPE_SANDBOX)]);
        assert_eq!(image_name(&sandbox, "").as_deref(), Some(DEFAULT_PAUSE_IMAGE));
        assert_eq!(
            image_name(&sandbox, "example.com/pause:1").as_deref(),
            Some("example.com/pause:1")
        );

        let crio = annotations(&[
            (CRI_IMAGE_NAME, "containerd-image"),
            (CRIO_IMAGE_NAME, "crio-image"),
        ]);
        assert_eq!(image_name(&crio, "").as_deref(), Some("crio-image"));
        assert_eq!(image_name(&HashMap::new(), "pause"), None);
    }

    #[test]
    fn test_pulls_in_guest() {
        let guest = Storage {
            driver: IMAGE_GUEST_PULL_DRIVER.into(),
            ..Default::default()
        };
        assert!(pulls_in_guest(&[Storage::default(), guest]));
        assert!(!pulls_in_guest(&[Storage::default()]));
    }
}
