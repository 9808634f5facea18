//! An in-memory card honoring the DESFire-ish permission model
//!
//! Used by the token, gate and keymaker tests. The emulation tracks the
//! selected application and the authenticated key slot, and enforces key
//! rights, file access rights and directory access the way the composite
//! operations rely on. Data is stored in the clear; `CommMode` is only
//! checked for agreement with the file settings.

use super::*;
use std::collections::BTreeMap;

struct EmFile {
    settings: StdFileSettings,
    data: Vec<u8>,
}

struct EmApp {
    settings: AppSettings,
    keys: Vec<AnyKey>,
    files: BTreeMap<FileId, EmFile>,
}

pub struct EmulatedCard {
    uid: TokenId,
    root_key: AnyKey,
    root_rights: KeyRights,
    apps: BTreeMap<u32, EmApp>,
    /// Packed aid of the selected application; 0 is the root.
    selected: u32,
    /// Authenticated key slot of the selected application.
    auth: Option<u8>,
}

impl EmulatedCard {
    pub fn new(uid: TokenId) -> Self {
        EmulatedCard {
            uid,
            root_key: AnyKey::default_des(),
            root_rights: KeyRights {
                allowed_to_change_keys: ChangeKeyPolicy::OnlyMaster,
                master_key_changeable: true,
                dir_access_without_auth: true,
                create_delete_without_auth: true,
                config_changeable: true,
            },
            apps: BTreeMap::new(),
            selected: 0,
            auth: None,
        }
    }

    /// Direct access to a stored file payload, for tamper tests.
    pub fn file_data_mut(&mut self, aid: AppId, fid: FileId) -> &mut Vec<u8> {
        &mut self
            .apps
            .get_mut(&aid.pack())
            .expect("no such app")
            .files
            .get_mut(&fid)
            .expect("no such file")
            .data
    }

    /// Overwrite an application's settings behind the card's back, for
    /// integrity-check tests.
    pub fn corrupt_app_settings(&mut self, aid: AppId, settings: AppSettings) {
        self.apps.get_mut(&aid.pack()).expect("no such app").settings = settings;
    }

    /// Overwrite a file's settings behind the card's back.
    pub fn corrupt_file_settings(&mut self, aid: AppId, fid: FileId, settings: StdFileSettings) {
        self.apps
            .get_mut(&aid.pack())
            .expect("no such app")
            .files
            .get_mut(&fid)
            .expect("no such file")
            .settings = settings;
    }

    fn selected_app(&mut self) -> Result<&mut EmApp> {
        self.apps.get_mut(&self.selected).ok_or(Error::AppNotFound)
    }

    fn is_root_selected(&self) -> bool {
        self.selected == 0
    }

    fn dir_access_allowed(&self) -> bool {
        let rights = if self.is_root_selected() {
            &self.root_rights
        } else {
            match self.apps.get(&self.selected) {
                Some(app) => &app.settings.rights,
                None => return false,
            }
        };
        rights.dir_access_without_auth || self.auth.is_some()
    }

    fn create_delete_allowed(&self) -> bool {
        let rights = if self.is_root_selected() {
            &self.root_rights
        } else {
            match self.apps.get(&self.selected) {
                Some(app) => &app.settings.rights,
                None => return false,
            }
        };
        rights.create_delete_without_auth || self.auth == Some(0)
    }

    fn access_granted(&self, access: Access) -> bool {
        match access {
            Access::Free => true,
            Access::Never => false,
            Access::Key(n) => self.auth == Some(n),
        }
    }
}

impl CardInterface for EmulatedCard {
    fn select_application(&mut self, aid: AppId) -> Result<()> {
        let packed = aid.pack();
        if packed != 0 && !self.apps.contains_key(&packed) {
            // Selection state is unchanged on failure.
            return Err(Error::AppNotFound);
        }
        self.selected = packed;
        self.auth = None;
        Ok(())
    }

    fn authenticate(&mut self, key: &AnyKey) -> Result<()> {
        let stored = if self.is_root_selected() {
            if key.key_no() != 0 {
                return Err(Error::Parameter);
            }
            self.root_key
        } else {
            let app = self.selected_app()?;
            *app.keys
                .get(usize::from(key.key_no()))
                .ok_or(Error::Parameter)?
        };
        if stored != *key {
            self.auth = None;
            return Err(Error::PermissionDenied);
        }
        self.auth = Some(key.key_no());
        Ok(())
    }

    fn change_key(&mut self, new_key: &AnyKey) -> Result<()> {
        let auth = self.auth.ok_or(Error::PermissionDenied)?;
        let slot = new_key.key_no();
        if self.is_root_selected() {
            if slot != 0 {
                return Err(Error::Parameter);
            }
            if !self.root_rights.master_key_changeable {
                return Err(Error::PermissionDenied);
            }
            self.root_key = *new_key;
            self.auth = None;
            return Ok(());
        }
        let app = self.selected_app()?;
        if usize::from(slot) >= app.keys.len() {
            return Err(Error::Parameter);
        }
        if app.settings.crypto == AppCrypto::Aes128 && !matches!(new_key, AnyKey::Aes128(_)) {
            return Err(Error::Parameter);
        }
        let allowed = if slot == 0 {
            auth == 0 && app.settings.rights.master_key_changeable
        } else {
            match app.settings.rights.allowed_to_change_keys {
                ChangeKeyPolicy::OnlyMaster => auth == 0,
                // A fresh (factory valued) slot may still be seeded by the
                // master; once set, only the slot itself can rotate.
                ChangeKeyPolicy::SameKey => {
                    auth == slot
                        || (auth == 0
                            && matches!(app.keys[usize::from(slot)], AnyKey::Aes128(k) if k.is_default()))
                }
                ChangeKeyPolicy::Frozen => false,
            }
        };
        if !allowed {
            return Err(Error::PermissionDenied);
        }
        app.keys[usize::from(slot)] = *new_key;
        if auth == slot {
            self.auth = None;
        }
        Ok(())
    }

    fn change_app_settings(&mut self, rights: KeyRights) -> Result<()> {
        if self.auth != Some(0) {
            return Err(Error::PermissionDenied);
        }
        if self.is_root_selected() {
            if !self.root_rights.config_changeable {
                return Err(Error::PermissionDenied);
            }
            self.root_rights = rights;
        } else {
            let app = self.selected_app()?;
            if !app.settings.rights.config_changeable {
                return Err(Error::PermissionDenied);
            }
            app.settings.rights = rights;
        }
        Ok(())
    }

    fn get_app_settings(&mut self) -> Result<AppSettings> {
        if self.is_root_selected() {
            if self.auth.is_none() {
                return Err(Error::PermissionDenied);
            }
            return Ok(AppSettings {
                crypto: AppCrypto::LegacyDes,
                rights: self.root_rights,
                extra_keys: 0,
            });
        }
        Ok(self.selected_app()?.settings)
    }

    fn create_application(&mut self, aid: AppId, settings: AppSettings) -> Result<()> {
        if !self.is_root_selected() {
            return Err(Error::Parameter);
        }
        if !self.create_delete_allowed() {
            return Err(Error::PermissionDenied);
        }
        let packed = aid.pack();
        if packed == 0 || self.apps.contains_key(&packed) {
            return Err(Error::Parameter);
        }
        let default_key = match settings.crypto {
            AppCrypto::Aes128 => AnyKey::Aes128(Aes128Key::default_with_no(0)),
            AppCrypto::LegacyDes => AnyKey::Des {
                key_no: 0,
                data: [0; 8],
            },
        };
        let mut keys = Vec::new();
        for key_no in 0..=settings.extra_keys {
            keys.push(match default_key {
                AnyKey::Aes128(_) => AnyKey::Aes128(Aes128Key::default_with_no(key_no)),
                AnyKey::Des { .. } => AnyKey::Des {
                    key_no,
                    data: [0; 8],
                },
            });
        }
        self.apps.insert(
            packed,
            EmApp {
                settings,
                keys,
                files: BTreeMap::new(),
            },
        );
        Ok(())
    }

    fn delete_application(&mut self, aid: AppId) -> Result<()> {
        if !self.is_root_selected() {
            return Err(Error::Parameter);
        }
        if !self.create_delete_allowed() {
            return Err(Error::PermissionDenied);
        }
        self.apps
            .remove(&aid.pack())
            .map(|_| ())
            .ok_or(Error::AppNotFound)
    }

    fn get_application_ids(&mut self) -> Result<Vec<AppId>> {
        if !self.is_root_selected() {
            return Err(Error::Parameter);
        }
        if !self.dir_access_allowed() {
            return Err(Error::PermissionDenied);
        }
        Ok(self.apps.keys().map(|&packed| AppId::unpack(packed)).collect())
    }

    fn get_file_ids(&mut self) -> Result<Vec<FileId>> {
        if !self.dir_access_allowed() {
            return Err(Error::PermissionDenied);
        }
        Ok(self.selected_app()?.files.keys().copied().collect())
    }

    fn create_file(&mut self, fid: FileId, settings: StdFileSettings) -> Result<()> {
        if !self.create_delete_allowed() {
            return Err(Error::PermissionDenied);
        }
        let app = self.selected_app()?;
        if app.files.contains_key(&fid) {
            return Err(Error::Parameter);
        }
        app.files.insert(
            fid,
            EmFile {
                settings,
                data: Vec::new(),
            },
        );
        Ok(())
    }

    fn delete_file(&mut self, fid: FileId) -> Result<()> {
        if !self.create_delete_allowed() {
            return Err(Error::PermissionDenied);
        }
        self.selected_app()?
            .files
            .remove(&fid)
            .map(|_| ())
            .ok_or(Error::FileNotFound)
    }

    fn get_file_settings(&mut self, fid: FileId) -> Result<FileSettings> {
        if !self.dir_access_allowed() {
            return Err(Error::PermissionDenied);
        }
        let app = self.selected_app()?;
        let file = app.files.get(&fid).ok_or(Error::FileNotFound)?;
        Ok(FileSettings::Standard(file.settings))
    }

    fn change_file_settings(&mut self, fid: FileId, settings: StdFileSettings) -> Result<()> {
        let granted = {
            let app = self.apps.get(&self.selected).ok_or(Error::AppNotFound)?;
            let file = app.files.get(&fid).ok_or(Error::FileNotFound)?;
            self.access_granted(file.settings.rights.change)
        };
        if !granted {
            return Err(Error::PermissionDenied);
        }
        let app = self.selected_app()?;
        app.files.get_mut(&fid).ok_or(Error::FileNotFound)?.settings = settings;
        Ok(())
    }

    fn read_data(&mut self, fid: FileId, mode: CommMode) -> Result<Vec<u8>> {
        let app = self.apps.get(&self.selected).ok_or(Error::AppNotFound)?;
        let file = app.files.get(&fid).ok_or(Error::FileNotFound)?;
        if file.settings.security != mode {
            return Err(Error::Parameter);
        }
        if !self.access_granted(file.settings.rights.read)
            && !self.access_granted(file.settings.rights.read_write)
        {
            return Err(Error::PermissionDenied);
        }
        Ok(file.data.clone())
    }

    fn write_data(&mut self, fid: FileId, data: &[u8], mode: CommMode) -> Result<()> {
        let granted = {
            let app = self.apps.get(&self.selected).ok_or(Error::AppNotFound)?;
            let file = app.files.get(&fid).ok_or(Error::FileNotFound)?;
            if file.settings.security != mode {
                return Err(Error::Parameter);
            }
            self.access_granted(file.settings.rights.write)
                || self.access_granted(file.settings.rights.read_write)
        };
        if !granted {
            return Err(Error::PermissionDenied);
        }
        let app = self.selected_app()?;
        app.files.get_mut(&fid).ok_or(Error::FileNotFound)?.data = data.to_vec();
        Ok(())
    }

    fn format_picc(&mut self) -> Result<()> {
        if !self.is_root_selected() || self.auth != Some(0) {
            return Err(Error::PermissionDenied);
        }
        self.apps.clear();
        Ok(())
    }

    fn get_info(&mut self) -> Result<CardInfo> {
        Ok(CardInfo {
            serial_no: self.uid.0,
        })
    }

    fn get_card_uid(&mut self) -> Result<TokenId> {
        Ok(self.uid)
    }
}
