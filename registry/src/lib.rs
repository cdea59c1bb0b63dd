//! VM Object (spec §4.4, component C4) and Domain Registry (component C5):
//! the in-process collection of known domains, keyed by id, name and uuid,
//! with definitions persisted under a config directory. Grounded on the
//! teacher's device/vsock collection pattern in `vmm::lib.rs` — an
//! `RwLock`-guarded map behind a small facade, rather than exposing the
//! lock to callers.

use std::collections::HashMap;
use std::fs;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use domain::{DefinitionFormat, DefinitionParse, DomainDefinition};

#[derive(Debug)]
pub enum Error {
    NotFound(String),
    DuplicateName(String),
    Invalid(String),
    Io(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotFound(what) => write!(f, "no such domain: {}", what),
            Error::DuplicateName(name) => write!(f, "domain name already in use: {}", name),
            Error::Invalid(msg) => write!(f, "invalid domain definition: {}", msg),
            Error::Io(e) => write!(f, "registry i/o error: {}", e),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    Shutoff,
    Running,
    Paused,
    Crashed,
}

/// Runtime record for one domain: the persisted definition plus the
/// process-lifetime state a running VM accumulates. Interior-mutable so the
/// registry can hand out `Arc<VmObject>` to multiple callers (lifecycle
/// controller, reactor, API dispatch) without a registry-wide lock held for
/// the VM's entire lifetime (spec §4.4's lock-ordering note: registry lock
/// is only ever held to look a VM up, never across a VM operation).
pub struct VmObject {
    pub id: u32,
    def: RwLock<DomainDefinition>,
    pub state: Mutex<DomainState>,
    pub pid: Mutex<Option<i32>>,
    pub monitor_fd: Mutex<Option<RawFd>>,
    pub autostart: Mutex<bool>,
    /// Has a config file and survives daemon restart; set once at creation
    /// (spec §3: `define` is persistent, `createFromXML` is not).
    pub persistent: bool,
    /// The spec's numeric id: unique among active VMs, assigned monotonically
    /// at start, reset to -1 on stop (spec §4.4). Distinct from `id` above,
    /// which is this registry's permanent handle and never changes.
    pub runtime_id: Mutex<i64>,
    pub stdout_fd: Mutex<Option<RawFd>>,
    pub stderr_fd: Mutex<Option<RawFd>>,
    pub reactor_tokens: Mutex<Vec<u64>>,
    pub vcpu_pids: Mutex<Vec<i32>>,
    pub vnc_port: Mutex<Option<u16>>,
    pub log_path: Mutex<Option<PathBuf>>,
}

impl VmObject {
    fn new(id: u32, def: DomainDefinition, persistent: bool) -> Self {
        VmObject {
            id,
            def: RwLock::new(def),
            state: Mutex::new(DomainState::Shutoff),
            pid: Mutex::new(None),
            monitor_fd: Mutex::new(None),
            autostart: Mutex::new(false),
            persistent,
            runtime_id: Mutex::new(-1),
            stdout_fd: Mutex::new(None),
            stderr_fd: Mutex::new(None),
            reactor_tokens: Mutex::new(Vec::new()),
            vcpu_pids: Mutex::new(Vec::new()),
            vnc_port: Mutex::new(None),
            log_path: Mutex::new(None),
        }
    }

    pub fn runtime_id(&self) -> i64 {
        *self.runtime_id.lock().unwrap()
    }

    pub fn set_runtime_id(&self, id: i64) {
        *self.runtime_id.lock().unwrap() = id;
    }

    pub fn vcpu_pids(&self) -> Vec<i32> {
        self.vcpu_pids.lock().unwrap().clone()
    }

    pub fn set_vcpu_pids(&self, pids: Vec<i32>) {
        *self.vcpu_pids.lock().unwrap() = pids;
    }

    pub fn vnc_port(&self) -> Option<u16> {
        *self.vnc_port.lock().unwrap()
    }

    /// Resets every piece of process-lifetime state back to "never started"
    /// (spec §4.5 shutdown step 3). Does not touch `state` itself; the
    /// caller sets that last, once the process is confirmed reaped.
    pub fn clear_runtime(&self) {
        *self.pid.lock().unwrap() = None;
        *self.monitor_fd.lock().unwrap() = None;
        *self.stdout_fd.lock().unwrap() = None;
        *self.stderr_fd.lock().unwrap() = None;
        self.reactor_tokens.lock().unwrap().clear();
        *self.runtime_id.lock().unwrap() = -1;
        self.vcpu_pids.lock().unwrap().clear();
        *self.vnc_port.lock().unwrap() = None;
        *self.log_path.lock().unwrap() = None;
    }

    pub fn definition(&self) -> DomainDefinition {
        self.def.read().unwrap().clone()
    }

    pub fn name(&self) -> String {
        self.def.read().unwrap().name.clone()
    }

    pub fn uuid(&self) -> String {
        self.def.read().unwrap().uuid.clone()
    }

    pub fn state(&self) -> DomainState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: DomainState) {
        *self.state.lock().unwrap() = state;
    }

    fn set_definition(&self, def: DomainDefinition) {
        *self.def.write().unwrap() = def;
    }

    /// Lets callers outside this crate (device hot-plug, spec §4.8) apply an
    /// in-place edit to the definition without exposing the lock itself.
    /// Callers are responsible for persisting afterwards via
    /// `Registry::persist` once the monitor has confirmed the change.
    pub fn update_definition(&self, f: impl FnOnce(&mut DomainDefinition)) {
        f(&mut self.def.write().unwrap());
    }
}

struct Inner {
    next_id: u32,
    by_id: HashMap<u32, Arc<VmObject>>,
    order: Vec<u32>,
    name_index: HashMap<String, u32>,
    uuid_index: HashMap<String, u32>,
}

impl Inner {
    fn new() -> Self {
        Inner {
            next_id: 1,
            by_id: HashMap::new(),
            order: Vec::new(),
            name_index: HashMap::new(),
            uuid_index: HashMap::new(),
        }
    }
}

/// The domain collection plus the three directories spec §4.4 names:
/// definitions live in `config_dir`, transient save state in `state_dir`,
/// autostart markers in `autostart_dir`.
pub struct Registry {
    inner: RwLock<Inner>,
    config_dir: PathBuf,
    state_dir: PathBuf,
    autostart_dir: PathBuf,
}

impl Registry {
    pub fn new<P: AsRef<Path>>(config_dir: P, state_dir: P, autostart_dir: P) -> Self {
        Registry {
            inner: RwLock::new(Inner::new()),
            config_dir: config_dir.as_ref().to_path_buf(),
            state_dir: state_dir.as_ref().to_path_buf(),
            autostart_dir: autostart_dir.as_ref().to_path_buf(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Inserts or, if `def.uuid` already names a known domain, redefines it
    /// in place. Per spec §4.4, a uuid match wins over a name match: if the
    /// same uuid reappears under a new name, the existing record is
    /// renamed rather than rejected as a duplicate. A name collision is
    /// only an error when the uuid does not already own that slot.
    pub fn define(&self, def: DomainDefinition) -> Result<Arc<VmObject>> {
        self.insert(def, true)
    }

    /// `createFromXML` (spec §3): a VM with no config file, removed from the
    /// registry the moment it reaches SHUTOFF rather than persisting.
    pub fn create_transient(&self, def: DomainDefinition) -> Result<Arc<VmObject>> {
        self.insert(def, false)
    }

    fn insert(&self, def: DomainDefinition, persistent: bool) -> Result<Arc<VmObject>> {
        def.validate().map_err(|e| Error::Invalid(e.to_string()))?;
        let mut inner = self.inner.write().unwrap();

        if let Some(&id) = inner.uuid_index.get(&def.uuid) {
            let vm = inner.by_id.get(&id).unwrap().clone();
            let old_name = vm.name();
            if old_name != def.name {
                if inner.name_index.contains_key(&def.name) {
                    return Err(Error::DuplicateName(def.name.clone()));
                }
                inner.name_index.remove(&old_name);
                inner.name_index.insert(def.name.clone(), id);
            }
            vm.set_definition(def);
            return Ok(vm);
        }

        if inner.name_index.contains_key(&def.name) {
            return Err(Error::DuplicateName(def.name.clone()));
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let vm = Arc::new(VmObject::new(id, def.clone(), persistent));
        inner.by_id.insert(id, vm.clone());
        inner.order.push(id);
        inner.name_index.insert(def.name.clone(), id);
        inner.uuid_index.insert(def.uuid.clone(), id);
        Ok(vm)
    }

    /// Removes `id` from the in-memory registry and, per spec §4.4, both its
    /// config file and its autostart symlink (if any). The caller must
    /// already know the VM is SHUTOFF; undefining an active VM is the
    /// `Driver`'s job to reject.
    pub fn undefine(&self, id: u32) -> Result<()> {
        let name = self.remove_entry(id)?.name();
        let _ = fs::remove_file(self.config_path(&name));
        let _ = fs::remove_file(self.autostart_path(&name));
        Ok(())
    }

    /// Removes a non-persistent VM from the registry in the same critical
    /// section its state flips to SHUTOFF (spec §3). No config/autostart
    /// files to clean up, since a transient VM never had any.
    pub fn remove_transient(&self, id: u32) -> Option<Arc<VmObject>> {
        self.remove_entry(id).ok()
    }

    fn remove_entry(&self, id: u32) -> Result<Arc<VmObject>> {
        let mut inner = self.inner.write().unwrap();
        let vm = inner
            .by_id
            .remove(&id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        inner.order.retain(|&x| x != id);
        inner.name_index.remove(&vm.name());
        inner.uuid_index.remove(&vm.uuid());
        Ok(vm)
    }

    pub fn lookup_by_id(&self, id: u32) -> Option<Arc<VmObject>> {
        self.inner.read().unwrap().by_id.get(&id).cloned()
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<VmObject>> {
        let inner = self.inner.read().unwrap();
        inner
            .name_index
            .get(name)
            .and_then(|id| inner.by_id.get(id).cloned())
    }

    pub fn lookup_by_uuid(&self, uuid: &str) -> Option<Arc<VmObject>> {
        let inner = self.inner.read().unwrap();
        inner
            .uuid_index
            .get(uuid)
            .and_then(|id| inner.by_id.get(id).cloned())
    }

    /// All known domains in definition order (spec §4.4's `list` op).
    pub fn list(&self) -> Vec<Arc<VmObject>> {
        let inner = self.inner.read().unwrap();
        inner
            .order
            .iter()
            .filter_map(|id| inner.by_id.get(id).cloned())
            .collect()
    }

    fn config_path(&self, name: &str) -> PathBuf {
        self.config_dir.join(format!("{}.xml", name))
    }

    fn autostart_path(&self, name: &str) -> PathBuf {
        self.autostart_dir.join(format!("{}.xml", name))
    }

    /// Writes `vm`'s definition to `<config_dir>/<name>.xml` via the
    /// injected formatter (spec §6 collaborator seam).
    pub fn persist<F: DefinitionFormat>(&self, vm: &VmObject, fmt: &F) -> Result<()> {
        let def = vm.definition();
        let data = fmt.format(&def);
        fs::write(self.config_path(&def.name), data).map_err(Error::Io)
    }

    pub fn remove_persisted(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.config_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Loads every `*.xml` definition under `config_dir`, defining each one
    /// and marking it autostart-on if a matching marker exists under
    /// `autostart_dir` (spec F's "autostart-on-init" supplement).
    pub fn load_all<F: DefinitionParse>(&self, fmt: &F) -> Result<usize> {
        let mut loaded = 0;
        let entries = match fs::read_dir(&self.config_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::Io(e)),
        };
        for entry in entries {
            let entry = entry.map_err(Error::Io)?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("xml") {
                continue;
            }
            let raw = fs::read_to_string(&path).map_err(Error::Io)?;
            let def = fmt
                .parse(&raw)
                .map_err(|e| Error::Invalid(format!("{}: {}", path.display(), e)))?;
            let name = def.name.clone();
            let vm = self.define(def)?;
            if self.autostart_path(&name).exists() {
                *vm.autostart.lock().unwrap() = true;
            }
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Domains with autostart set, in definition order — the init-time
    /// caller starts each of these (spec F's autostart supplement).
    pub fn autostart_domains(&self) -> Vec<Arc<VmObject>> {
        self.list()
            .into_iter()
            .filter(|vm| *vm.autostart.lock().unwrap())
            .collect()
    }

    /// Toggles the `<autostartDir>/<name>.xml → <configDir>/<name>.xml`
    /// symlink (spec §4.4: "toggling autostart creates or removes only the
    /// symlink").
    pub fn set_autostart(&self, id: u32, on: bool) -> Result<()> {
        let vm = self
            .lookup_by_id(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let name = vm.name();
        let link = self.autostart_path(&name);
        if on {
            let _ = fs::remove_file(&link);
            std::os::unix::fs::symlink(self.config_path(&name), &link).map_err(Error::Io)?;
        } else {
            match fs::remove_file(&link) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        *vm.autostart.lock().unwrap() = on;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::testing::JsonFormat;
    use domain::{CharDeviceDefinition, VirtType};

    fn sample(name: &str, uuid: &str) -> DomainDefinition {
        DomainDefinition {
            name: name.to_string(),
            uuid: uuid.to_string(),
            emulator_path: "/usr/bin/qemu-kvm".into(),
            virt_type: VirtType::Accelerated,
            memory_max_kib: 65536,
            memory_current_kib: 65536,
            vcpu_count: 1,
            cpu_affinity: None,
            graphics: None,
            disks: vec![],
            net_interfaces: vec![],
            serials: vec![CharDeviceDefinition::pty()],
            parallels: vec![],
            host_devices: vec![],
        }
    }

    fn registry(dir: &tempfile::TempDir) -> Registry {
        let config = dir.path().join("config");
        let state = dir.path().join("state");
        let autostart = dir.path().join("autostart");
        std::fs::create_dir_all(&config).unwrap();
        std::fs::create_dir_all(&state).unwrap();
        std::fs::create_dir_all(&autostart).unwrap();
        Registry::new(config, state, autostart)
    }

    #[test]
    fn test_define_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        let vm = reg
            .define(sample("alpha", "00000000-0000-0000-0000-000000000001"))
            .unwrap();
        assert_eq!(reg.lookup_by_id(vm.id).unwrap().name(), "alpha");
        assert!(reg.lookup_by_name("alpha").is_some());
        assert!(reg
            .lookup_by_uuid("00000000-0000-0000-0000-000000000001")
            .is_some());
    }

    #[test]
    fn test_define_rejects_duplicate_name_different_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        reg.define(sample("alpha", "00000000-0000-0000-0000-000000000001"))
            .unwrap();
        let err = reg
            .define(sample("alpha", "00000000-0000-0000-0000-000000000002"))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateName(_)));
    }

    #[test]
    fn test_define_same_uuid_renames() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        let vm = reg
            .define(sample("alpha", "00000000-0000-0000-0000-000000000001"))
            .unwrap();
        let id = vm.id;
        let renamed = reg
            .define(sample("beta", "00000000-0000-0000-0000-000000000001"))
            .unwrap();
        assert_eq!(renamed.id, id);
        assert_eq!(renamed.name(), "beta");
        assert!(reg.lookup_by_name("alpha").is_none());
        assert!(reg.lookup_by_name("beta").is_some());
    }

    #[test]
    fn test_undefine() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        let vm = reg
            .define(sample("alpha", "00000000-0000-0000-0000-000000000001"))
            .unwrap();
        reg.undefine(vm.id).unwrap();
        assert!(reg.lookup_by_id(vm.id).is_none());
        assert!(matches!(reg.undefine(vm.id), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_persist_and_load_all() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        let vm = reg
            .define(sample("alpha", "00000000-0000-0000-0000-000000000001"))
            .unwrap();
        reg.persist(&*vm, &JsonFormat).unwrap();
        reg.set_autostart(vm.id, true).unwrap();

        let reg2 = registry(&dir);
        let loaded = reg2.load_all(&JsonFormat).unwrap();
        assert_eq!(loaded, 1);
        let reloaded = reg2.lookup_by_name("alpha").unwrap();
        assert_eq!(*reloaded.autostart.lock().unwrap(), true);
    }

    #[test]
    fn test_list_is_insertion_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        reg.define(sample("b", "00000000-0000-0000-0000-000000000002"))
            .unwrap();
        reg.define(sample("a", "00000000-0000-0000-0000-000000000001"))
            .unwrap();
        let names: Vec<String> = reg.list().iter().map(|vm| vm.name()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }
}
