//! Best-effort system probes for GPU and system memory.
//!
//! Each probe shells out to the vendor tool when present and parses its
//! output; a missing tool simply contributes no devices. The parsers are
//! split out as pure functions so they can be tested on canned output.

use std::path::PathBuf;
use std::process::Command;

use super::{DeviceDescriptor, DeviceId, LibraryTag};

const MIB: u64 = 1024 * 1024;

/// Probe every backend plus system memory. Order matters: the scheduler
/// fills devices in the order they appear here.
pub fn probe_devices() -> Vec<DeviceDescriptor> {
    let mut devices = Vec::new();
    devices.extend(probe_nvidia());
    devices.extend(probe_rocm());
    devices.extend(probe_metal());
    devices.push(cpu_descriptor());
    devices
}

/// NVIDIA devices via `nvidia-smi` CSV query.
fn probe_nvidia() -> Vec<DeviceDescriptor> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,name,memory.total,memory.free,compute_cap",
            "--format=csv,noheader,nounits",
        ])
        .output();

    match output {
        Ok(out) if out.status.success() => {
            parse_nvidia_smi(&String::from_utf8_lossy(&out.stdout))
        }
        _ => Vec::new(),
    }
}

/// Parse `nvidia-smi --query-gpu=... --format=csv,noheader,nounits` output.
/// Memory figures are in MiB.
fn parse_nvidia_smi(stdout: &str) -> Vec<DeviceDescriptor> {
    let mut devices = Vec::new();
    for line in stdout.lines() {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 5 {
            continue;
        }
        let (Ok(index), Ok(total_mib), Ok(free_mib)) = (
            fields[0].parse::<u32>(),
            fields[2].parse::<u64>(),
            fields[3].parse::<u64>(),
        ) else {
            continue;
        };
        let compute_capability = fields[4]
            .split_once('.')
            .and_then(|(major, minor)| Some((major.parse().ok()?, minor.parse().ok()?)));
        devices.push(DeviceDescriptor {
            id: DeviceId::new(format!("cuda:{}", index)),
            library: LibraryTag::Cuda,
            name: fields[1].to_string(),
            total_vram: total_mib * MIB,
            free_vram: free_mib * MIB,
            os_overhead: 0,
            compute_capability,
            dependency_paths: cuda_dependency_paths(),
        });
    }
    devices
}

fn cuda_dependency_paths() -> Vec<PathBuf> {
    ["/usr/local/cuda/lib64", "/usr/lib/x86_64-linux-gnu"]
        .iter()
        .map(PathBuf::from)
        .filter(|p| p.exists())
        .collect()
}

/// AMD devices via `rocm-smi` CSV memory query.
fn probe_rocm() -> Vec<DeviceDescriptor> {
    let output = Command::new("rocm-smi")
        .args(["--showmeminfo", "vram", "--csv"])
        .output();

    match output {
        Ok(out) if out.status.success() => parse_rocm_smi(&String::from_utf8_lossy(&out.stdout)),
        _ => Vec::new(),
    }
}

/// Parse `rocm-smi --showmeminfo vram --csv` output. Figures are in bytes:
/// `device,VRAM Total Memory (B),VRAM Total Used Memory (B)`.
fn parse_rocm_smi(stdout: &str) -> Vec<DeviceDescriptor> {
    let mut devices = Vec::new();
    for line in stdout.lines().skip(1) {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 3 || !fields[0].starts_with("card") {
            continue;
        }
        let (Ok(total), Ok(used)) = (fields[1].parse::<u64>(), fields[2].parse::<u64>()) else {
            continue;
        };
        let index = fields[0].trim_start_matches("card");
        devices.push(DeviceDescriptor {
            id: DeviceId::new(format!("rocm:{}", index)),
            library: LibraryTag::Rocm,
            name: format!("AMD GPU {}", index),
            total_vram: total,
            free_vram: total.saturating_sub(used),
            os_overhead: 0,
            compute_capability: None,
            dependency_paths: Vec::new(),
        });
    }
    devices
}

/// Apple Silicon unified memory as a single Metal device.
fn probe_metal() -> Vec<DeviceDescriptor> {
    #[cfg(target_os = "macos")]
    {
        let total = Command::new("sysctl")
            .args(["-n", "hw.memsize"])
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .and_then(|s| s.trim().parse::<u64>().ok());
        if let Some(total) = total {
            // Metal caps the recommended working set below physical RAM
            let budget = total * 3 / 4;
            return vec![DeviceDescriptor {
                id: DeviceId::new("metal:0"),
                library: LibraryTag::Metal,
                name: "Apple Silicon".into(),
                total_vram: budget,
                free_vram: budget,
                os_overhead: 0,
                compute_capability: None,
                dependency_paths: Vec::new(),
            }];
        }
        Vec::new()
    }
    #[cfg(not(target_os = "macos"))]
    {
        Vec::new()
    }
}

/// System RAM as the CPU fallback device.
pub fn cpu_descriptor() -> DeviceDescriptor {
    let (total, available) = detect_ram();
    DeviceDescriptor {
        id: DeviceId::new("cpu"),
        library: LibraryTag::Cpu,
        name: "system memory".into(),
        total_vram: total,
        free_vram: available,
        os_overhead: 0,
        compute_capability: None,
        dependency_paths: Vec::new(),
    }
}

/// Detect total and available RAM in bytes.
fn detect_ram() -> (u64, u64) {
    #[cfg(target_os = "linux")]
    {
        if let Ok(content) = std::fs::read_to_string("/proc/meminfo") {
            return parse_meminfo(&content);
        }
    }

    #[cfg(target_os = "macos")]
    {
        let total = Command::new("sysctl")
            .args(["-n", "hw.memsize"])
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .and_then(|s| s.trim().parse::<u64>().ok());
        if let Some(total) = total {
            return (total, total / 2);
        }
    }

    // Fallback: assume 8GB total, 4GB available
    (8192 * MIB, 4096 * MIB)
}

/// Parse /proc/meminfo for MemTotal and MemAvailable (values are in kB).
fn parse_meminfo(content: &str) -> (u64, u64) {
    fn field_kb(content: &str, field: &str) -> Option<u64> {
        content.lines().find_map(|line| {
            let rest = line.strip_prefix(field)?;
            rest.split_whitespace().next()?.parse().ok()
        })
    }

    let total = field_kb(content, "MemTotal:").map(|kb| kb * 1024).unwrap_or(8192 * MIB);
    let available = field_kb(content, "MemAvailable:")
        .map(|kb| kb * 1024)
        .unwrap_or(total / 2);
    (total, available)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nvidia_smi() {
        let out = "0, NVIDIA GeForce RTX 4090, 24564, 23011, 8.9\n\
                   1, NVIDIA GeForce RTX 3060, 12288, 11020, 8.6\n";
        let devices = parse_nvidia_smi(out);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].id.as_str(), "cuda:0");
        assert_eq!(devices[0].name, "NVIDIA GeForce RTX 4090");
        assert_eq!(devices[0].total_vram, 24564 * MIB);
        assert_eq!(devices[0].free_vram, 23011 * MIB);
        assert_eq!(devices[0].compute_capability, Some((8, 9)));
        assert_eq!(devices[1].id.as_str(), "cuda:1");
    }

    #[test]
    fn test_parse_nvidia_smi_garbage() {
        assert!(parse_nvidia_smi("No devices were found\n").is_empty());
        assert!(parse_nvidia_smi("").is_empty());
    }

    #[test]
    fn test_parse_rocm_smi() {
        let out = "device,VRAM Total Memory (B),VRAM Total Used Memory (B)\n\
                   card0,17163091968,1073741824\n";
        let devices = parse_rocm_smi(out);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id.as_str(), "rocm:0");
        assert_eq!(devices[0].total_vram, 17163091968);
        assert_eq!(devices[0].free_vram, 17163091968 - 1073741824);
    }

    #[test]
    fn test_parse_meminfo() {
        let content = "MemTotal:       32614144 kB\n\
                       MemFree:         1060244 kB\n\
                       MemAvailable:   24080956 kB\n";
        let (total, available) = parse_meminfo(content);
        assert_eq!(total, 32614144 * 1024);
        assert_eq!(available, 24080956 * 1024);
    }

    #[test]
    fn test_cpu_descriptor() {
        let cpu = cpu_descriptor();
        assert_eq!(cpu.library, LibraryTag::Cpu);
        assert!(cpu.total_vram > 0);
        assert!(cpu.free_vram <= cpu.total_vram);
    }
}
