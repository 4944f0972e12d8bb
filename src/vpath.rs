//! 가상 경로와 서버 루트
//!
//! 클라이언트에 보이는 경로는 항상 `/`로 시작하는 절대 경로이며
//! `..`는 루트에서 멈춘다. 실제 파일시스템 경로로 바꿀 때는
//! 정규화(canonicalize)된 경로가 루트 안에 있는지 다시 확인한다.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// 서버 루트 기준 가상 경로
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct VirtualPath {
    components: Vec<String>,
}

impl VirtualPath {
    pub fn root() -> Self {
        Self::default()
    }

    /// 절대 가상 경로 파싱
    pub fn parse(path: &str) -> Result<Self> {
        Self::root().join(path)
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// 한 단계 위 (루트에서는 그대로)
    pub fn parent(&self) -> Self {
        let mut components = self.components.clone();
        components.pop();
        Self { components }
    }

    /// 상대(또는 `/`로 시작하는 절대) 경로 결합
    pub fn join(&self, path: &str) -> Result<Self> {
        let mut components = if path.starts_with('/') {
            Vec::new()
        } else {
            self.components.clone()
        };

        for part in path.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    components.pop();
                }
                name => {
                    if name.contains('\\') || name.contains(':') {
                        return Err(Error::PathEscape(path.to_string()));
                    }
                    if name.contains('\0') {
                        return Err(Error::Format(format!("잘못된 경로: {:?}", path)));
                    }
                    components.push(name.to_string());
                }
            }
        }

        Ok(Self { components })
    }

    pub fn file_name(&self) -> Option<&str> {
        self.components.last().map(String::as_str)
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.components.iter().map(String::as_str)
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.components.join("/"))
    }
}

/// 서버 루트 디렉토리
#[derive(Debug, Clone)]
pub struct ServerRoot {
    root: PathBuf,
}

impl ServerRoot {
    /// 루트 디렉토리 준비 (없으면 생성)
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        let root = std::fs::canonicalize(root.as_ref())?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// 가상 경로 → 실제 경로 (어휘적 변환만)
    pub fn resolve(&self, vpath: &VirtualPath) -> PathBuf {
        let mut path = self.root.clone();
        for component in vpath.components() {
            path.push(component);
        }
        path
    }

    /// 실제 경로가 루트를 벗어나지 않는지 확인
    ///
    /// 존재하는 가장 가까운 조상을 정규화해서 비교하므로 심볼릭 링크로도 빠져나갈 수 없음
    pub async fn check_contained(&self, path: &Path) -> Result<()> {
        let mut ancestor = path;
        loop {
            match tokio::fs::canonicalize(ancestor).await {
                Ok(real) => {
                    if real.starts_with(&self.root) {
                        return Ok(());
                    }
                    return Err(Error::PathEscape(path.display().to_string()));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => match ancestor.parent() {
                    Some(parent) => ancestor = parent,
                    None => return Err(Error::PathEscape(path.display().to_string())),
                },
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// 가상 경로를 실제 경로로 바꾸고 루트 포함 여부 확인
    pub async fn resolve_checked(&self, vpath: &VirtualPath) -> Result<PathBuf> {
        let path = self.resolve(vpath);
        self.check_contained(&path).await?;
        Ok(path)
    }
}
