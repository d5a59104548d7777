// 内存子系统的可恢复错误
// 只有资源耗尽和查询落空这两类情况会以 Err 返回给调用者；
// 不变式被破坏（重映射、越界地址、解除不存在的映射）一律 panic，
// 因为那说明内核自身有逻辑缺陷，继续跑只会在坏掉的地址空间上越错越远

use core::fmt::Display;

/// 页一级的查询错误
#[derive(Debug, PartialEq, Eq)]
pub enum PageError {
    /// 中间级页表节点缺失，walk 半路断了
    DirPageInvalid,
    /// 叶子页表项无效或者不是叶子
    PageInvalid,
    /// 页面没有 U 标志，不许从用户路径访问
    NotUserAccessible,
}

/// 内存错误
#[derive(Debug, PartialEq, Eq)]
pub enum MemoryError {
    /// 物理页帧耗尽
    MemoryNotEnough,
    /// 分页错误
    PageError(PageError),
    /// 用户字符串在允许的长度内没有出现终止符
    UnterminatedString,
}

/// 对内存错误的包装
pub type MemoryResult<R> = core::result::Result<R, MemoryError>;

impl Display for PageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PageError::DirPageInvalid => f.write_str("DirPageInvalid"),
            PageError::PageInvalid => f.write_str("PageInvalid"),
            PageError::NotUserAccessible => f.write_str("NotUserAccessible"),
        }
    }
}

impl Display for MemoryError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MemoryError::MemoryNotEnough => f.write_str("MemoryNotEnough"),
            MemoryError::PageError(pe) => pe.fmt(f),
            MemoryError::UnterminatedString => f.write_str("UnterminatedString"),
        }
    }
}

impl From<PageError> for MemoryError {
    fn from(value: PageError) -> Self {
        Self::PageError(value)
    }
}
