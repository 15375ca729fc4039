//! Section storage with double-buffered data.
//!
//! Every mutation is split into a prepare step, which stages the change
//! without making it visible, and a commit or rollback step. Data writes are
//! staged in the shadow buffer (the one not selected by `data_index`); commit
//! flips the index and drops the old buffer, rollback drops the shadow.

use serde::{Deserialize, Serialize};

use crate::store::{
    now_satime, CkptAttributes, CkptError, CkptResult, DataState, SaTime,
    SectionDescriptor, SectionsChosen, TIME_END,
};

/// Section lifecycle state.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SectionState {
    CreatePrepared,
    CreateCommitted,
    DeletePrepared,
}

/// State of an in-flight data update on a section.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum UpdateState {
    Idle,
    Prepared,
    Committed,
    Rollbacked,
}

/// One named section.
#[derive(Debug, Clone)]
pub struct Section {
    /// Section ID; empty for the default section.
    id: Vec<u8>,

    expiration: SaTime,
    last_update: SaTime,

    /// Two data buffers; `buffers[data_index]` is the active one.
    buffers: [Vec<u8>; 2],
    data_index: usize,

    data_state: DataState,
    state: SectionState,
    update: UpdateState,
}

impl Section {
    fn new(id: Vec<u8>, expiration: SaTime, data: Vec<u8>) -> Self {
        Section {
            id,
            expiration,
            last_update: now_satime(),
            buffers: [data, Vec::new()],
            data_index: 0,
            data_state: DataState::Valid,
            state: SectionState::CreatePrepared,
            update: UpdateState::Idle,
        }
    }

    fn default_section() -> Self {
        let mut section = Section::new(vec![], TIME_END, vec![]);
        section.state = SectionState::CreateCommitted;
        section
    }

    /// Section ID.
    pub fn id(&self) -> &[u8] {
        &self.id
    }

    /// Currently committed (active) data.
    pub fn data(&self) -> &[u8] {
        &self.buffers[self.data_index]
    }

    pub fn expiration(&self) -> SaTime {
        self.expiration
    }

    pub fn state(&self) -> SectionState {
        self.state
    }

    pub fn update_state(&self) -> UpdateState {
        self.update
    }

    /// Whether readers may observe this section.
    fn visible(&self) -> bool {
        self.state != SectionState::CreatePrepared
    }

    fn shadow_index(&self) -> usize {
        (self.data_index + 1) % 2
    }

    /// Stages new content into the shadow buffer.
    fn stage(&mut self, content: Vec<u8>) {
        let shadow = self.shadow_index();
        self.buffers[shadow] = content;
        self.update = UpdateState::Prepared;
    }

    /// Makes staged content active and drops the previous buffer.
    fn commit_data(&mut self) {
        if self.update != UpdateState::Prepared {
            return;
        }
        let old = self.data_index;
        self.data_index = self.shadow_index();
        self.buffers[old] = Vec::new();
        self.last_update = now_satime();
        self.update = UpdateState::Committed;
    }

    /// Drops staged content.
    fn rollback_data(&mut self) {
        if self.update != UpdateState::Prepared {
            return;
        }
        let shadow = self.shadow_index();
        self.buffers[shadow] = Vec::new();
        self.update = UpdateState::Rollbacked;
    }

    pub fn descriptor(&self) -> SectionDescriptor {
        SectionDescriptor {
            id: self.id.clone(),
            expiration: self.expiration,
            size: self.data().len() as u64,
            data_state: self.data_state,
            last_update: self.last_update,
        }
    }

    fn chosen(&self, chosen: SectionsChosen, expiration: SaTime) -> bool {
        match chosen {
            SectionsChosen::Forever => self.expiration == TIME_END,
            SectionsChosen::LeqExpiration => self.expiration <= expiration,
            SectionsChosen::GeqExpiration => self.expiration >= expiration,
            SectionsChosen::Corrupted => {
                self.data_state == DataState::Corrupted
            }
            SectionsChosen::Any => true,
        }
    }
}

/// Serializable snapshot of one committed section, used when packing a
/// replica or pushing a synchronization image.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct SectionImage {
    pub id: Vec<u8>,
    pub data_state: DataState,
    pub expiration: SaTime,
    pub last_update: SaTime,
    pub data: Vec<u8>,
}

/// Per-replica collection of sections. The default section (empty ID) is
/// always present and cannot be deleted.
#[derive(Debug, Clone)]
pub struct SectionStore {
    sections: Vec<Section>,
}

impl SectionStore {
    /// Creates a store holding only the empty default section.
    pub fn new() -> Self {
        SectionStore {
            sections: vec![Section::default_section()],
        }
    }

    fn position(&self, id: &[u8]) -> Option<usize> {
        self.sections.iter().position(|s| s.id == id)
    }

    fn visible_position(&self, id: &[u8]) -> CkptResult<usize> {
        match self.position(id) {
            Some(idx) if self.sections[idx].visible() => Ok(idx),
            _ => Err(CkptError::NotExist),
        }
    }

    /// Finds a visible section by ID.
    pub fn find(&self, id: &[u8]) -> Option<&Section> {
        self.position(id)
            .map(|idx| &self.sections[idx])
            .filter(|s| s.visible())
    }

    /// Number of visible sections, default section included.
    pub fn count(&self) -> u32 {
        self.sections.iter().filter(|s| s.visible()).count() as u32
    }

    /// Total bytes of committed data across visible sections.
    pub fn memory_used(&self) -> u64 {
        self.sections
            .iter()
            .filter(|s| s.visible())
            .map(|s| s.data().len() as u64)
            .sum()
    }

    /// Reads up to `size` bytes at `offset` from a section's committed data.
    pub fn read(
        &self,
        id: &[u8],
        offset: u64,
        size: u64,
    ) -> CkptResult<Vec<u8>> {
        let section = self.find(id).ok_or(CkptError::NotExist)?;
        let data = section.data();
        let len = data.len() as u64;
        if offset > len {
            return Err(CkptError::InvalidParam);
        }
        let mut end = offset.saturating_add(size);
        if end > len {
            pf_debug!(
                "read of {} bytes at {} truncated to {}",
                size,
                offset,
                len - offset
            );
            end = len;
        }
        if end == offset {
            return Err(CkptError::FailedOperation);
        }
        Ok(data[offset as usize..end as usize].to_vec())
    }

    /// Descriptors of visible sections matching the selection.
    pub fn query(
        &self,
        chosen: SectionsChosen,
        expiration: SaTime,
    ) -> Vec<SectionDescriptor> {
        self.sections
            .iter()
            .filter(|s| s.visible() && s.chosen(chosen, expiration))
            .map(|s| s.descriptor())
            .collect()
    }

    /// Checks the checkpoint-wide size ceiling if `old_len` bytes of some
    /// section were replaced with `new_len` bytes.
    fn check_total(
        &self,
        attrs: &CkptAttributes,
        old_len: u64,
        new_len: u64,
    ) -> CkptResult<()> {
        let total = self.memory_used() - old_len + new_len;
        if total > attrs.checkpoint_size {
            Err(CkptError::FailedOperation)
        } else {
            Ok(())
        }
    }

    pub fn prepare_create(
        &mut self,
        attrs: &CkptAttributes,
        id: &[u8],
        expiration: SaTime,
        data: &[u8],
    ) -> CkptResult<()> {
        if id.is_empty() || id.len() > attrs.max_section_id_size as usize {
            return Err(CkptError::InvalidParam);
        }
        if self.position(id).is_some() {
            return Err(CkptError::Exist);
        }
        if self.sections.len() >= attrs.max_sections as usize
            || data.len() as u64 > attrs.max_section_size
        {
            return Err(CkptError::FailedOperation);
        }
        self.check_total(attrs, 0, data.len() as u64)?;

        self.sections
            .push(Section::new(id.to_vec(), expiration, data.to_vec()));
        Ok(())
    }

    pub fn commit_create(&mut self, id: &[u8]) -> CkptResult<()> {
        let idx = self.position(id).ok_or(CkptError::NotExist)?;
        let section = &mut self.sections[idx];
        if section.state == SectionState::CreatePrepared {
            section.state = SectionState::CreateCommitted;
            section.last_update = now_satime();
        }
        Ok(())
    }

    pub fn rollback_create(&mut self, id: &[u8]) {
        if let Some(idx) = self.position(id) {
            if self.sections[idx].state == SectionState::CreatePrepared {
                self.sections.remove(idx);
            }
        }
    }

    pub fn prepare_delete(&mut self, id: &[u8]) -> CkptResult<()> {
        if id.is_empty() {
            return Err(CkptError::InvalidParam);
        }
        let idx = self.visible_position(id)?;
        self.sections[idx].state = SectionState::DeletePrepared;
        Ok(())
    }

    pub fn commit_delete(&mut self, id: &[u8]) -> CkptResult<()> {
        let idx = self.position(id).ok_or(CkptError::NotExist)?;
        self.sections.remove(idx);
        Ok(())
    }

    pub fn rollback_delete(&mut self, id: &[u8]) {
        if let Some(idx) = self.position(id) {
            if self.sections[idx].state == SectionState::DeletePrepared {
                self.sections[idx].state = SectionState::CreateCommitted;
            }
        }
    }

    /// Stages a write of `data` at `offset`. The unmodified prefix and
    /// suffix are carried over from the active buffer; a gap beyond the
    /// current end is zero-filled.
    pub fn prepare_write(
        &mut self,
        attrs: &CkptAttributes,
        id: &[u8],
        offset: u64,
        data: &[u8],
    ) -> CkptResult<()> {
        let idx = self.visible_position(id)?;
        let active = self.sections[idx].data();
        let old_len = active.len() as u64;
        let new_len = old_len.max(offset.saturating_add(data.len() as u64));
        if new_len > attrs.max_section_size {
            return Err(CkptError::FailedOperation);
        }
        self.check_total(attrs, old_len, new_len)?;

        let mut content = vec![0; new_len as usize];
        content[..active.len()].copy_from_slice(active);
        let start = offset as usize;
        content[start..start + data.len()].copy_from_slice(data);
        self.sections[idx].stage(content);
        Ok(())
    }

    /// Stages a full replacement of a section's content.
    pub fn prepare_overwrite(
        &mut self,
        attrs: &CkptAttributes,
        id: &[u8],
        data: &[u8],
    ) -> CkptResult<()> {
        let idx = self.visible_position(id)?;
        let new_len = data.len() as u64;
        if new_len > attrs.max_section_size {
            return Err(CkptError::FailedOperation);
        }
        let old_len = self.sections[idx].data().len() as u64;
        self.check_total(attrs, old_len, new_len)?;

        self.sections[idx].stage(data.to_vec());
        Ok(())
    }

    pub fn commit_data(&mut self, id: &[u8]) -> CkptResult<()> {
        let idx = self.position(id).ok_or(CkptError::NotExist)?;
        self.sections[idx].commit_data();
        Ok(())
    }

    pub fn rollback_data(&mut self, id: &[u8]) {
        if let Some(idx) = self.position(id) {
            self.sections[idx].rollback_data();
        }
    }

    /// Validates an expiration change; nothing is staged.
    pub fn prepare_expiration(&self, id: &[u8]) -> CkptResult<()> {
        if id.is_empty() {
            return Err(CkptError::InvalidParam);
        }
        self.visible_position(id).map(|_| ())
    }

    pub fn commit_expiration(
        &mut self,
        id: &[u8],
        expiration: SaTime,
    ) -> CkptResult<()> {
        let idx = self.visible_position(id)?;
        self.sections[idx].expiration = expiration;
        Ok(())
    }

    /// Abandons every staged change. Used when the node that drove the
    /// pending two-phase operation is gone.
    pub fn rollback_all(&mut self) {
        self.sections
            .retain(|s| s.state != SectionState::CreatePrepared);
        for section in self.sections.iter_mut() {
            section.rollback_data();
            if section.state == SectionState::DeletePrepared {
                section.state = SectionState::CreateCommitted;
            }
        }
    }

    /// Snapshot of all committed sections.
    pub fn image(&self) -> Vec<SectionImage> {
        self.sections
            .iter()
            .filter(|s| s.visible())
            .map(|s| SectionImage {
                id: s.id.clone(),
                data_state: s.data_state,
                expiration: s.expiration,
                last_update: s.last_update,
                data: s.data().to_vec(),
            })
            .collect()
    }

    /// Rebuilds a store from a snapshot. The default section is added if
    /// the image lacks it.
    pub fn from_image(image: Vec<SectionImage>) -> Self {
        let mut sections: Vec<Section> = image
            .into_iter()
            .map(|img| Section {
                id: img.id,
                expiration: img.expiration,
                last_update: img.last_update,
                buffers: [img.data, Vec::new()],
                data_index: 0,
                data_state: img.data_state,
                state: SectionState::CreateCommitted,
                update: UpdateState::Idle,
            })
            .collect();
        if !sections.iter().any(|s| s.id.is_empty()) {
            sections.insert(0, Section::default_section());
        }
        SectionStore { sections }
    }
}

impl Default for SectionStore {
    fn default() -> Self {
        Self::new()
    }
}
