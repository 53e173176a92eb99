//! Access-control policy for the listening endpoint.
//!
//! The launcher serves both normal processes and sandboxed (app-container)
//! processes, so the default policy grants full access to the Everyone group
//! and to the ALL APPLICATION PACKAGES group. This is deliberately broad;
//! narrowing it to the current user's SID breaks sandboxed clients.

use thiserror::Error;

/// Failure to construct the access-control policy. Startup-fatal: the
/// endpoint must not be created without one.
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("failed to allocate access-control primitive: {0}")]
    Allocation(std::io::Error),
    #[cfg(windows)]
    #[error("failed to build access-control list (status {0})")]
    AclEntries(u32),
}

/// The endpoint access-control policy on unix: filesystem modes applied to
/// the per-user endpoint directory and to the socket itself after bind.
///
/// Built once per process, immutable thereafter.
#[cfg(unix)]
pub struct SecurityPolicy {
    socket_mode: u32,
    directory_mode: u32,
}

#[cfg(unix)]
impl SecurityPolicy {
    /// Construct the default policy: world-connectable socket inside a
    /// world-traversable per-user directory.
    pub fn build() -> Result<Self, SecurityError> {
        Ok(Self {
            socket_mode: 0o666,
            directory_mode: 0o755,
        })
    }

    /// Apply the directory mode to the per-user endpoint directory.
    pub fn apply_to_directory(&self, path: &std::path::Path) -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(self.directory_mode))
    }

    /// Apply the socket mode to a freshly bound endpoint.
    pub fn apply_to_socket(&self, path: &std::path::Path) -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(self.socket_mode))
    }
}

/// The endpoint access-control policy on windows: an owned security
/// descriptor whose DACL holds exactly two trustee entries, Everyone and
/// ALL APPLICATION PACKAGES, each granted `GENERIC_ALL` with inheritance to
/// sub-objects.
///
/// Built once per process, immutable thereafter. Every OS allocation behind
/// it (two SIDs, the ACL, the descriptor) is released exactly once on drop.
#[cfg(windows)]
pub struct SecurityPolicy {
    everyone_sid: windows_sys::Win32::Foundation::PSID,
    all_app_packages_sid: windows_sys::Win32::Foundation::PSID,
    acl: *mut windows_sys::Win32::Security::ACL,
    descriptor: windows_sys::Win32::Security::PSECURITY_DESCRIPTOR,
    attributes: windows_sys::Win32::Security::SECURITY_ATTRIBUTES,
}

// SAFETY: the policy is write-once. After `build` returns, the SIDs, ACL,
// descriptor, and attribute block are never mutated, so sharing references
// across tasks is sound.
#[cfg(windows)]
unsafe impl Send for SecurityPolicy {}
#[cfg(windows)]
unsafe impl Sync for SecurityPolicy {}

#[cfg(windows)]
impl SecurityPolicy {
    pub fn build() -> Result<Self, SecurityError> {
        use std::mem;
        use std::ptr;

        use windows_sys::Win32::Foundation::GENERIC_ALL;
        use windows_sys::Win32::Security::Authorization::{
            SetEntriesInAclW, EXPLICIT_ACCESS_W, NO_MULTIPLE_TRUSTEE, SET_ACCESS,
            SUB_CONTAINERS_AND_OBJECTS_INHERIT, TRUSTEE_IS_GROUP, TRUSTEE_IS_SID,
            TRUSTEE_IS_WELL_KNOWN_GROUP, TRUSTEE_W,
        };
        use windows_sys::Win32::Security::{
            AllocateAndInitializeSid, InitializeSecurityDescriptor, SetSecurityDescriptorDacl,
            SECURITY_APP_PACKAGE_AUTHORITY, SECURITY_ATTRIBUTES, SECURITY_DESCRIPTOR,
            SECURITY_DESCRIPTOR_REVISION, SECURITY_WORLD_SID_AUTHORITY,
        };
        use windows_sys::Win32::System::Memory::{LocalAlloc, LPTR};

        // SECURITY_APP_PACKAGE_BASE_RID / SECURITY_BUILTIN_PACKAGE_ANY_PACKAGE
        // sub-authorities of the ALL APPLICATION PACKAGES group.
        const APP_PACKAGE_BASE_RID: u32 = 0x0000_0002;
        const BUILTIN_PACKAGE_ANY_PACKAGE: u32 = 0x0000_0001;
        const WORLD_RID: u32 = 0x0000_0000;

        // Filled in progressively; Drop releases whatever was allocated if a
        // later step fails.
        let mut policy = Self {
            everyone_sid: ptr::null_mut(),
            all_app_packages_sid: ptr::null_mut(),
            acl: ptr::null_mut(),
            descriptor: ptr::null_mut(),
            attributes: unsafe { mem::zeroed() },
        };

        // SAFETY: AllocateAndInitializeSid writes a newly allocated SID into
        // the out pointer; both out pointers are valid and released in Drop.
        unsafe {
            if AllocateAndInitializeSid(
                &SECURITY_WORLD_SID_AUTHORITY,
                1,
                WORLD_RID,
                0,
                0,
                0,
                0,
                0,
                0,
                0,
                &mut policy.everyone_sid,
            ) == 0
            {
                return Err(SecurityError::Allocation(std::io::Error::last_os_error()));
            }

            if AllocateAndInitializeSid(
                &SECURITY_APP_PACKAGE_AUTHORITY,
                2,
                APP_PACKAGE_BASE_RID,
                BUILTIN_PACKAGE_ANY_PACKAGE,
                0,
                0,
                0,
                0,
                0,
                0,
                &mut policy.all_app_packages_sid,
            ) == 0
            {
                return Err(SecurityError::Allocation(std::io::Error::last_os_error()));
            }
        }

        let trustee = |sid: windows_sys::Win32::Foundation::PSID, trustee_type| TRUSTEE_W {
            pMultipleTrustee: ptr::null_mut(),
            MultipleTrusteeOperation: NO_MULTIPLE_TRUSTEE,
            TrusteeForm: TRUSTEE_IS_SID,
            TrusteeType: trustee_type,
            ptstrName: sid as *mut u16,
        };

        let mut entries = [
            EXPLICIT_ACCESS_W {
                grfAccessPermissions: GENERIC_ALL,
                grfAccessMode: SET_ACCESS,
                grfInheritance: SUB_CONTAINERS_AND_OBJECTS_INHERIT,
                Trustee: trustee(policy.everyone_sid, TRUSTEE_IS_WELL_KNOWN_GROUP),
            },
            EXPLICIT_ACCESS_W {
                grfAccessPermissions: GENERIC_ALL,
                grfAccessMode: SET_ACCESS,
                grfInheritance: SUB_CONTAINERS_AND_OBJECTS_INHERIT,
                Trustee: trustee(policy.all_app_packages_sid, TRUSTEE_IS_GROUP),
            },
        ];

        // SAFETY: the entry array outlives the call; the ACL written into
        // `policy.acl` is a LocalAlloc allocation released in Drop.
        unsafe {
            let status = SetEntriesInAclW(
                entries.len() as u32,
                entries.as_mut_ptr(),
                ptr::null(),
                &mut policy.acl,
            );
            if status != 0 {
                return Err(SecurityError::AclEntries(status));
            }

            policy.descriptor = LocalAlloc(LPTR, mem::size_of::<SECURITY_DESCRIPTOR>());
            if policy.descriptor.is_null() {
                return Err(SecurityError::Allocation(std::io::Error::last_os_error()));
            }

            if InitializeSecurityDescriptor(policy.descriptor, SECURITY_DESCRIPTOR_REVISION) == 0 {
                return Err(SecurityError::Allocation(std::io::Error::last_os_error()));
            }

            if SetSecurityDescriptorDacl(policy.descriptor, 1, policy.acl, 0) == 0 {
                return Err(SecurityError::Allocation(std::io::Error::last_os_error()));
            }
        }

        policy.attributes = windows_sys::Win32::Security::SECURITY_ATTRIBUTES {
            nLength: mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: policy.descriptor,
            bInheritHandle: 1,
        };

        Ok(policy)
    }

    /// Pointer handed to pipe creation as the raw security-attributes block.
    /// Valid for as long as the policy is alive.
    pub fn attributes_ptr(&self) -> *mut std::ffi::c_void {
        &self.attributes as *const _ as *mut std::ffi::c_void
    }
}

#[cfg(windows)]
impl Drop for SecurityPolicy {
    fn drop(&mut self) {
        use windows_sys::Win32::Security::FreeSid;
        use windows_sys::Win32::System::Memory::LocalFree;

        // SAFETY: each handle is freed at most once; null checks cover the
        // partially constructed case.
        unsafe {
            if !self.everyone_sid.is_null() {
                FreeSid(self.everyone_sid);
            }
            if !self.all_app_packages_sid.is_null() {
                FreeSid(self.all_app_packages_sid);
            }
            if !self.acl.is_null() {
                LocalFree(self.acl as _);
            }
            if !self.descriptor.is_null() {
                LocalFree(self.descriptor as _);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn default_policy_grants_broad_local_access() {
        let policy = SecurityPolicy::build().unwrap();
        assert_eq!(policy.socket_mode, 0o666);
        assert_eq!(policy.directory_mode, 0o755);
    }
}
