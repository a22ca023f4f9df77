//! assembling one rootfs view out of several materialized trees, using the
//! most capable placement mechanism available, with guaranteed teardown.

pub mod bind;
pub mod copy;
pub mod overlay;
pub mod placer;

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{Error, IoResultExt, Result};

pub use bind::BindPlacer;
pub use copy::CopyPlacer;
pub use overlay::OverlayPlacer;
pub use placer::{Emplacement, Placer};

/// one request to get a source tree into place inside the rootfs
///
/// `bare_mount && writable` deliberately surrenders reproducibility: the
/// source itself becomes mutable through the mount. the assembler warns
/// but proceeds.
#[derive(Debug, Clone)]
pub struct AssemblyPart {
    /// path in the assembled rootfs context, e.g. "/" or "/data"
    pub target_path: PathBuf,
    /// the materialized tree to respect
    pub source_path: PathBuf,
    pub writable: bool,
    pub bare_mount: bool,
}

impl AssemblyPart {
    pub fn new(target_path: impl Into<PathBuf>, source_path: impl Into<PathBuf>) -> Self {
        Self {
            target_path: target_path.into(),
            source_path: source_path.into(),
            writable: false,
            bare_mount: false,
        }
    }

    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    pub fn bare_mount(mut self, bare_mount: bool) -> Self {
        self.bare_mount = bare_mount;
        self
    }
}

#[derive(Debug)]
enum PartState {
    Pending,
    Emplaced(Emplacement),
    TornDown,
}

/// an assembled rootfs: the ordered set of active emplacements
///
/// teardown reverses them in LIFO order. an assembly references its source
/// trees, it does not own them; tearing it down leaves the sources intact.
#[derive(Debug)]
pub struct Assembly {
    parts: Vec<(AssemblyPart, PartState)>,
}

impl Assembly {
    /// reverse every emplacement, last placed first; idempotent
    ///
    /// teardown keeps going past individual failures and reports the first
    /// one, so one stuck mount does not pin every later resource.
    pub fn teardown(&mut self) -> Result<()> {
        let mut first_error = None;
        for (_, state) in self.parts.iter_mut().rev() {
            match std::mem::replace(state, PartState::TornDown) {
                PartState::Emplaced(mut emplacement) => {
                    if let Err(e) = emplacement.teardown() {
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
                // tearing down a part that never got emplaced is a no-op
                PartState::Pending | PartState::TornDown => {}
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

enum PlacerChoice {
    /// negotiate per part: bind where privileged, overlay for writable
    /// parts, copy as the universal fallback
    Auto {
        bind: BindPlacer,
        overlay: OverlayPlacer,
        copy: CopyPlacer,
    },
    Fixed(Box<dyn Placer>),
}

/// assembles a filesystem from scattered pieces
pub struct Assembler {
    choice: PlacerChoice,
}

impl Assembler {
    /// an assembler that negotiates the best available placer per part;
    /// `work_path` hosts overlay scratch areas
    pub fn new(work_path: &Path) -> Result<Self> {
        Ok(Self {
            choice: PlacerChoice::Auto {
                bind: BindPlacer,
                overlay: OverlayPlacer::new(&work_path.join("overlay-scratch"))?,
                copy: CopyPlacer,
            },
        })
    }

    /// an assembler pinned to one placer; used by unprivileged callers and
    /// tests
    pub fn with_placer(placer: Box<dyn Placer>) -> Self {
        Self {
            choice: PlacerChoice::Fixed(placer),
        }
    }

    fn select_placer(&self, part: &AssemblyPart) -> Result<&dyn Placer> {
        let can_mount = nix::unistd::Uid::effective().is_root();
        match &self.choice {
            PlacerChoice::Fixed(placer) => {
                if part.bare_mount && placer.name() != "bind" {
                    return Err(Error::Config(format!(
                        "part {:?} wants a bare mount but the {:?} placer cannot provide one",
                        part.target_path,
                        placer.name()
                    )));
                }
                Ok(placer.as_ref())
            }
            PlacerChoice::Auto {
                bind,
                overlay,
                copy,
            } => {
                if part.bare_mount {
                    if !can_mount {
                        return Err(Error::Config(format!(
                            "part {:?} wants a bare mount, which requires mount privileges",
                            part.target_path
                        )));
                    }
                    return Ok(bind);
                }
                if can_mount {
                    if part.writable {
                        Ok(overlay)
                    } else {
                        Ok(bind)
                    }
                } else {
                    Ok(copy)
                }
            }
        }
    }

    /// build the rootfs view at `base_path` from `parts`
    ///
    /// parts are placed in target-path order (shortest first, i.e. mount
    /// order); a failure part-way tears down what was already emplaced
    /// before returning.
    pub fn assemble(&self, base_path: &Path, mut parts: Vec<AssemblyPart>) -> Result<Assembly> {
        fs::create_dir_all(base_path).with_path(base_path)?;
        parts.sort_by(|a, b| a.target_path.cmp(&b.target_path));

        let mut assembly = Assembly {
            parts: parts
                .into_iter()
                .map(|p| (p, PartState::Pending))
                .collect(),
        };

        for index in 0..assembly.parts.len() {
            let part = assembly.parts[index].0.clone();
            if part.bare_mount && part.writable {
                warn!(
                    target = %part.target_path.display(),
                    "bare writable mount passes mutations through to the source; \
                     repeatability is out the window"
                );
            }

            let target = resolve_target(base_path, &part.target_path);
            if let Some(parent) = target.parent() {
                if let Err(e) = fs::create_dir_all(parent).with_path(parent) {
                    let _ = assembly.teardown();
                    return Err(e);
                }
            }

            let placer = match self.select_placer(&part) {
                Ok(placer) => placer,
                Err(e) => {
                    let _ = assembly.teardown();
                    return Err(e);
                }
            };
            match placer.place(&part.source_path, &target, part.writable, part.bare_mount) {
                Ok(emplacement) => {
                    assembly.parts[index].1 = PartState::Emplaced(emplacement);
                }
                Err(e) => {
                    let _ = assembly.teardown();
                    return Err(e);
                }
            }
        }

        Ok(assembly)
    }
}

/// join a container-context target path onto the base, treating the target
/// as rooted at the base
fn resolve_target(base_path: &Path, target_path: &Path) -> PathBuf {
    let rel = target_path
        .strip_prefix("/")
        .unwrap_or(target_path);
    if rel.as_os_str().is_empty() {
        base_path.to_path_buf()
    } else {
        base_path.join(rel)
    }
}
