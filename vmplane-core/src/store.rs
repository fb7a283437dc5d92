//! In-memory inventory of VMs and devices.
//!
//! Every mutation is published to the update feed while the write lock is
//! still held, so a `stat` never lags behind an entry a watcher has already
//! received, and entries for one object appear in mutation order.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};
use crate::model::{DeviceRef, DeviceStatus, DynamicId, DynamicValue, ObjectKind, Pci, Vbd, Vif, Vm};
use crate::updates::Updates;

#[derive(Default)]
pub(crate) struct Inventory {
    vms: BTreeMap<String, Vm>,
    vbds: BTreeMap<DeviceRef, Vbd>,
    vifs: BTreeMap<DeviceRef, Vif>,
    pcis: BTreeMap<DeviceRef, Pci>,
}

/// A device kind stored in the inventory.
pub(crate) trait DeviceRecord: Clone + PartialEq + Send + Sync + 'static {
    const KIND: ObjectKind;

    fn table(inventory: &Inventory) -> &BTreeMap<DeviceRef, Self>;
    fn table_mut(inventory: &mut Inventory) -> &mut BTreeMap<DeviceRef, Self>;
    fn dynamic_id(r: DeviceRef) -> DynamicId;
    fn dynamic_value(self) -> DynamicValue;
    fn device_ref(&self) -> DeviceRef;
    fn status(&self) -> &DeviceStatus;
}

impl DeviceRecord for Vbd {
    const KIND: ObjectKind = ObjectKind::Vbd;

    fn table(inventory: &Inventory) -> &BTreeMap<DeviceRef, Self> {
        &inventory.vbds
    }
    fn table_mut(inventory: &mut Inventory) -> &mut BTreeMap<DeviceRef, Self> {
        &mut inventory.vbds
    }
    fn dynamic_id(r: DeviceRef) -> DynamicId {
        DynamicId::Vbd(r)
    }
    fn dynamic_value(self) -> DynamicValue {
        DynamicValue::Vbd(self)
    }
    fn device_ref(&self) -> DeviceRef {
        DeviceRef::new(&self.config.vm, &self.config.id)
    }
    fn status(&self) -> &DeviceStatus {
        &self.state.status
    }
}

impl DeviceRecord for Vif {
    const KIND: ObjectKind = ObjectKind::Vif;

    fn table(inventory: &Inventory) -> &BTreeMap<DeviceRef, Self> {
        &inventory.vifs
    }
    fn table_mut(inventory: &mut Inventory) -> &mut BTreeMap<DeviceRef, Self> {
        &mut inventory.vifs
    }
    fn dynamic_id(r: DeviceRef) -> DynamicId {
        DynamicId::Vif(r)
    }
    fn dynamic_value(self) -> DynamicValue {
        DynamicValue::Vif(self)
    }
    fn device_ref(&self) -> DeviceRef {
        DeviceRef::new(&self.config.vm, &self.config.id)
    }
    fn status(&self) -> &DeviceStatus {
        &self.state.status
    }
}

impl DeviceRecord for Pci {
    const KIND: ObjectKind = ObjectKind::Pci;

    fn table(inventory: &Inventory) -> &BTreeMap<DeviceRef, Self> {
        &inventory.pcis
    }
    fn table_mut(inventory: &mut Inventory) -> &mut BTreeMap<DeviceRef, Self> {
        &mut inventory.pcis
    }
    fn dynamic_id(r: DeviceRef) -> DynamicId {
        DynamicId::Pci(r)
    }
    fn dynamic_value(self) -> DynamicValue {
        DynamicValue::Pci(self)
    }
    fn device_ref(&self) -> DeviceRef {
        DeviceRef::new(&self.config.vm, &self.config.id)
    }
    fn status(&self) -> &DeviceStatus {
        &self.state.status
    }
}

fn devices_of<D: DeviceRecord>(inventory: &Inventory, vm: &str) -> Vec<D> {
    D::table(inventory)
        .range(DeviceRef::new(vm, "")..)
        .take_while(|(r, _)| r.vm == vm)
        .map(|(_, d)| d.clone())
        .collect()
}

pub(crate) struct Store {
    inventory: RwLock<Inventory>,
    updates: Arc<Updates>,
}

impl Store {
    pub(crate) fn new(updates: Arc<Updates>) -> Self {
        Self {
            inventory: RwLock::new(Inventory::default()),
            updates,
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inventory>> {
        self.inventory.read().map_err(|_| Error::internal("Lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inventory>> {
        self.inventory.write().map_err(|_| Error::internal("Lock poisoned"))
    }

    // =========================================================================
    // VMs
    // =========================================================================

    pub(crate) fn add_vm(&self, vm: Vm) -> Result<()> {
        let mut inventory = self.write()?;
        let id = vm.id().to_string();
        if inventory.vms.contains_key(&id) {
            return Err(Error::already_exists(ObjectKind::Vm, id));
        }
        inventory.vms.insert(id.clone(), vm.clone());
        self.updates.record_created(DynamicId::Vm(id), DynamicValue::Vm(vm));
        Ok(())
    }

    /// Add a VM together with its devices, all or nothing.
    pub(crate) fn add_vm_with_devices(&self, vm: Vm, vbds: Vec<Vbd>, vifs: Vec<Vif>, pcis: Vec<Pci>) -> Result<()> {
        let mut inventory = self.write()?;
        let id = vm.id().to_string();
        if inventory.vms.contains_key(&id) {
            return Err(Error::already_exists(ObjectKind::Vm, id));
        }
        inventory.vms.insert(id.clone(), vm.clone());
        self.updates.record_created(DynamicId::Vm(id), DynamicValue::Vm(vm));

        for vbd in vbds {
            self.insert_device(&mut inventory, vbd);
        }
        for vif in vifs {
            self.insert_device(&mut inventory, vif);
        }
        for pci in pcis {
            self.insert_device(&mut inventory, pci);
        }
        Ok(())
    }

    /// Remove a VM and all of its devices. Devices are deleted first.
    ///
    /// `check` sees the VM under the write lock and can veto the removal.
    pub(crate) fn remove_vm<F>(&self, id: &str, check: F) -> Result<Vm>
    where
        F: FnOnce(&Vm) -> Result<()>,
    {
        let mut inventory = self.write()?;
        let vm = inventory
            .vms
            .get(id)
            .ok_or_else(|| Error::does_not_exist(ObjectKind::Vm, id))?;
        check(vm)?;

        self.remove_devices_of::<Vbd>(&mut inventory, id);
        self.remove_devices_of::<Vif>(&mut inventory, id);
        self.remove_devices_of::<Pci>(&mut inventory, id);

        let vm = inventory
            .vms
            .remove(id)
            .ok_or_else(|| Error::does_not_exist(ObjectKind::Vm, id))?;
        self.updates.record_removed(DynamicId::Vm(id.to_string()));
        Ok(vm)
    }

    pub(crate) fn vm(&self, id: &str) -> Result<Vm> {
        self.read()?
            .vms
            .get(id)
            .cloned()
            .ok_or_else(|| Error::does_not_exist(ObjectKind::Vm, id))
    }

    pub(crate) fn vm_exists(&self, id: &str) -> bool {
        self.read().map(|i| i.vms.contains_key(id)).unwrap_or(false)
    }

    pub(crate) fn vms(&self) -> Result<Vec<Vm>> {
        Ok(self.read()?.vms.values().cloned().collect())
    }

    /// Find the VM currently running in `domid`.
    pub(crate) fn vm_by_domid(&self, domid: u32) -> Result<Option<Vm>> {
        Ok(self
            .read()?
            .vms
            .values()
            .find(|vm| vm.state.domids.contains(&domid))
            .cloned())
    }

    /// Apply `f` to a VM. Publishes only if something changed.
    pub(crate) fn update_vm<F>(&self, id: &str, f: F) -> Result<Vm>
    where
        F: FnOnce(&mut Vm),
    {
        let mut inventory = self.write()?;
        let vm = inventory
            .vms
            .get_mut(id)
            .ok_or_else(|| Error::does_not_exist(ObjectKind::Vm, id))?;

        let before = vm.clone();
        f(vm);
        if *vm != before {
            self.updates
                .record(DynamicId::Vm(id.to_string()), DynamicValue::Vm(vm.clone()));
        }
        Ok(vm.clone())
    }

    // =========================================================================
    // Devices
    // =========================================================================

    fn insert_device<D: DeviceRecord>(&self, inventory: &mut Inventory, device: D) {
        let r = device.device_ref();
        D::table_mut(inventory).insert(r.clone(), device.clone());
        self.updates.record_created(D::dynamic_id(r), device.dynamic_value());
    }

    fn remove_devices_of<D: DeviceRecord>(&self, inventory: &mut Inventory, vm: &str) {
        for device in devices_of::<D>(inventory, vm) {
            let r = device.device_ref();
            D::table_mut(inventory).remove(&r);
            self.updates.record_removed(D::dynamic_id(r));
        }
    }

    pub(crate) fn add_device<D: DeviceRecord>(&self, device: D) -> Result<DeviceRef> {
        let mut inventory = self.write()?;
        let r = device.device_ref();
        if !inventory.vms.contains_key(&r.vm) {
            return Err(Error::does_not_exist(ObjectKind::Vm, r.vm));
        }
        if D::table(&inventory).contains_key(&r) {
            return Err(Error::already_exists(D::KIND, r.to_string()));
        }
        self.insert_device(&mut inventory, device);
        Ok(r)
    }

    /// Remove a device. `check` can veto the removal under the write lock.
    pub(crate) fn remove_device<D, F>(&self, r: &DeviceRef, check: F) -> Result<D>
    where
        D: DeviceRecord,
        F: FnOnce(&D) -> Result<()>,
    {
        let mut inventory = self.write()?;
        let table = D::table_mut(&mut inventory);
        let device = table
            .get(r)
            .ok_or_else(|| Error::does_not_exist(D::KIND, r.to_string()))?;
        check(device)?;
        let device = table
            .remove(r)
            .ok_or_else(|| Error::does_not_exist(D::KIND, r.to_string()))?;
        self.updates.record_removed(D::dynamic_id(r.clone()));
        Ok(device)
    }

    pub(crate) fn device<D: DeviceRecord>(&self, r: &DeviceRef) -> Result<D> {
        D::table(&*self.read()?)
            .get(r)
            .cloned()
            .ok_or_else(|| Error::does_not_exist(D::KIND, r.to_string()))
    }

    pub(crate) fn devices<D: DeviceRecord>(&self, vm: &str) -> Result<Vec<D>> {
        Ok(devices_of(&*self.read()?, vm))
    }

    /// Apply `f` to a device. Publishes only if something changed.
    pub(crate) fn update_device<D, F>(&self, r: &DeviceRef, f: F) -> Result<D>
    where
        D: DeviceRecord,
        F: FnOnce(&mut D),
    {
        let mut inventory = self.write()?;
        let device = D::table_mut(&mut inventory)
            .get_mut(r)
            .ok_or_else(|| Error::does_not_exist(D::KIND, r.to_string()))?;

        let before = device.clone();
        f(device);
        if *device != before {
            self.updates
                .record(D::dynamic_id(r.clone()), device.clone().dynamic_value());
        }
        Ok(device.clone())
    }

    // =========================================================================
    // Feed helpers
    // =========================================================================

    /// Run `f` with the ids of a VM and its devices while no mutation can
    /// happen.
    pub(crate) fn with_vm_ids<T>(&self, vm: &str, f: impl FnOnce(Vec<DynamicId>) -> Result<T>) -> Result<T> {
        let inventory = self.read()?;
        f(ids_of(&inventory, vm)?)
    }

    /// Re-publish the VM and all its devices.
    pub(crate) fn refresh_vm(&self, vm: &str) -> Result<()> {
        let inventory = self.read()?;
        let record = inventory
            .vms
            .get(vm)
            .ok_or_else(|| Error::does_not_exist(ObjectKind::Vm, vm))?;

        self.updates
            .record(DynamicId::Vm(vm.to_string()), DynamicValue::Vm(record.clone()));
        for vbd in devices_of::<Vbd>(&inventory, vm) {
            self.updates
                .record(Vbd::dynamic_id(vbd.device_ref()), vbd.dynamic_value());
        }
        for vif in devices_of::<Vif>(&inventory, vm) {
            self.updates
                .record(Vif::dynamic_id(vif.device_ref()), vif.dynamic_value());
        }
        for pci in devices_of::<Pci>(&inventory, vm) {
            self.updates
                .record(Pci::dynamic_id(pci.device_ref()), pci.dynamic_value());
        }
        Ok(())
    }
}

fn ids_of(inventory: &Inventory, vm: &str) -> Result<Vec<DynamicId>> {
    if !inventory.vms.contains_key(vm) {
        return Err(Error::does_not_exist(ObjectKind::Vm, vm));
    }
    let mut ids = vec![DynamicId::Vm(vm.to_string())];
    ids.extend(devices_of::<Vbd>(inventory, vm).iter().map(|d| Vbd::dynamic_id(d.device_ref())));
    ids.extend(devices_of::<Vif>(inventory, vm).iter().map(|d| Vif::dynamic_id(d.device_ref())));
    ids.extend(devices_of::<Pci>(inventory, vm).iter().map(|d| Pci::dynamic_id(d.device_ref())));
    Ok(ids)
}
