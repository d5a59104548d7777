// 页表项与Sv39三级页表的实现
// 页表项里R/W/X任意一位有效就是叶子，指向数据页；
// 只有V的有效项是中间节点，指向下一级页表；V为0就是未映射

use super::{
    frame_alloc, FrameTracker, MemoryError, MemoryResult, PageError, PhysAddr, PhysPageNum,
    VirtAddr, VirtPageNum,
};
use crate::config::{MAXVA, PAGE_SIZE};
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

bitflags! {
    // 页表项标志位，硬件规定的布局，一位都不能挪
    pub struct PTEFlags: u8 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;
    }
}

#[derive(Copy, Clone)]
#[repr(C)]
// 页表项，由【物理页号（44位）--标志位（10位，高2位保留）】拼接而成
pub struct PageTableEntry {
    pub bits: usize,
}

impl PageTableEntry {
    pub fn new(ppn: PhysPageNum, flags: PTEFlags) -> Self {
        PageTableEntry {
            bits: ppn.0 << 10 | flags.bits as usize,
        }
    }
    pub fn empty() -> Self {
        PageTableEntry { bits: 0 }
    }
    pub fn ppn(&self) -> PhysPageNum {
        (self.bits >> 10 & ((1usize << 44) - 1)).into()
    }
    pub fn flags(&self) -> PTEFlags {
        PTEFlags::from_bits(self.bits as u8).unwrap()
    }
    pub fn is_valid(&self) -> bool {
        (self.flags() & PTEFlags::V) != PTEFlags::empty()
    }
    // R/W/X 有任何一位就是叶子，上级页表项只会带 V
    pub fn is_leaf(&self) -> bool {
        (self.flags() & (PTEFlags::R | PTEFlags::W | PTEFlags::X)) != PTEFlags::empty()
    }
    pub fn readable(&self) -> bool {
        (self.flags() & PTEFlags::R) != PTEFlags::empty()
    }
    pub fn writable(&self) -> bool {
        (self.flags() & PTEFlags::W) != PTEFlags::empty()
    }
    pub fn executable(&self) -> bool {
        (self.flags() & PTEFlags::X) != PTEFlags::empty()
    }
    pub fn user_accessible(&self) -> bool {
        (self.flags() & PTEFlags::U) != PTEFlags::empty()
    }
}

// 多级页表，root_ppn是它的唯一标识
// frames 以 FrameTracker 的形式挂着根节点和所有中间节点占用的物理页帧，
// 数据页不归它管，归各逻辑段管，两边合起来才是一个地址空间的全部页帧
pub struct PageTable {
    root_ppn: PhysPageNum,
    frames: Vec<FrameTracker>,
}

impl PageTable {
    // 新建页表只需要一个干净的根节点，页帧耗尽时把错误交还调用者
    pub fn new() -> MemoryResult<Self> {
        let frame = frame_alloc().ok_or(MemoryError::MemoryNotEnough)?;
        Ok(PageTable {
            root_ppn: frame.ppn,
            frames: vec![frame],
        })
    }

    // 临时借一个satp token查别人的页表，frames为空，不实际持有任何页帧
    pub fn from_token(satp: usize) -> Self {
        Self {
            root_ppn: PhysPageNum::from(satp & ((1usize << 44) - 1)),
            frames: Vec::new(),
        }
    }

    pub fn root_ppn(&self) -> PhysPageNum {
        self.root_ppn
    }

    // 找到虚拟页号对应的叶子页表项，途中缺节点就现场分配一个挂上去
    // 新节点清零、只带V标志。地址越界是调用方的逻辑错误，直接panic
    fn find_pte_create(&mut self, vpn: VirtPageNum) -> MemoryResult<&mut PageTableEntry> {
        assert!(
            vpn.0 < MAXVA / PAGE_SIZE,
            "walk: {:?} out of Sv39 range",
            vpn
        );
        let idxs = vpn.indexes();
        let mut ppn = self.root_ppn;
        let mut result: Option<&mut PageTableEntry> = None;
        for (i, idx) in idxs.iter().enumerate() {
            let pte = &mut ppn.get_pte_array()[*idx];
            if i == 2 {
                result = Some(pte);
                break;
            }
            if !pte.is_valid() {
                let frame = frame_alloc().ok_or(MemoryError::MemoryNotEnough)?;
                *pte = PageTableEntry::new(frame.ppn, PTEFlags::V);
                self.frames.push(frame);
            }
            ppn = pte.ppn();
        }
        Ok(result.unwrap())
    }

    // 只查不建。越界和半路断掉都返回None
    fn find_pte(&self, vpn: VirtPageNum) -> Option<&PageTableEntry> {
        if vpn.0 >= MAXVA / PAGE_SIZE {
            return None;
        }
        let idxs = vpn.indexes();
        let mut ppn = self.root_ppn;
        let mut result: Option<&PageTableEntry> = None;
        for (i, idx) in idxs.iter().enumerate() {
            let pte = &ppn.get_pte_array()[*idx];
            if i == 2 {
                result = Some(pte);
                break;
            }
            if !pte.is_valid() {
                return None;
            }
            ppn = pte.ppn();
        }
        result
    }

    fn find_pte_mut(&mut self, vpn: VirtPageNum) -> Option<&mut PageTableEntry> {
        if vpn.0 >= MAXVA / PAGE_SIZE {
            return None;
        }
        let idxs = vpn.indexes();
        let mut ppn = self.root_ppn;
        let mut result: Option<&mut PageTableEntry> = None;
        for (i, idx) in idxs.iter().enumerate() {
            let pte = &mut ppn.get_pte_array()[*idx];
            if i == 2 {
                result = Some(pte);
                break;
            }
            if !pte.is_valid() {
                return None;
            }
            ppn = pte.ppn();
        }
        result
    }

    // 插入一个叶子映射。映射是一次写入的：盖在还有效的叶子上说明
    // 调用方没先解除旧映射，属于内核缺陷，panic
    pub fn map(&mut self, vpn: VirtPageNum, ppn: PhysPageNum, flags: PTEFlags) -> MemoryResult<()> {
        let pte = self.find_pte_create(vpn)?;
        assert!(!pte.is_valid(), "vpn {:?} is mapped before mapping", vpn);
        *pte = PageTableEntry::new(ppn, flags | PTEFlags::V);
        Ok(())
    }

    // 解除一个叶子映射。映射必须存在且必须是叶子
    pub fn unmap(&mut self, vpn: VirtPageNum) {
        let pte = self
            .find_pte_mut(vpn)
            .unwrap_or_else(|| panic!("unmap: {:?} walk failed", vpn));
        assert!(pte.is_valid(), "unmap: {:?} is not mapped", vpn);
        assert!(pte.is_leaf(), "unmap: {:?} is not a leaf", vpn);
        *pte = PageTableEntry::empty();
    }

    // 清掉U标志，把页面藏起来不让用户碰，给栈保护页用
    pub fn clear_user(&mut self, vpn: VirtPageNum) {
        let pte = self
            .find_pte_mut(vpn)
            .unwrap_or_else(|| panic!("clear_user: {:?} walk failed", vpn));
        assert!(pte.is_valid(), "clear_user: {:?} is not mapped", vpn);
        *pte = PageTableEntry {
            bits: pte.bits & !(PTEFlags::U.bits as usize),
        };
    }

    // 查到就把页表项拷贝一份出来，查不到None
    pub fn translate(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.find_pte(vpn).copied()
    }

    // 把用户虚拟地址解析成物理地址
    // 只许用来解析用户页：叶子必须有效且带U标志，内核映射天生没有U，查不出来
    pub fn translate_user(&self, va: VirtAddr) -> MemoryResult<PhysAddr> {
        if va.0 >= MAXVA {
            return Err(PageError::PageInvalid.into());
        }
        let pte = self.find_pte(va.floor()).ok_or(PageError::DirPageInvalid)?;
        if !pte.is_valid() || !pte.is_leaf() {
            return Err(PageError::PageInvalid.into());
        }
        if !pte.user_accessible() {
            return Err(PageError::NotUserAccessible.into());
        }
        let pa: PhysAddr = pte.ppn().into();
        Ok(PhysAddr(pa.0 + va.page_offset()))
    }

    // 按satp CSR的格式拼出token：分页模式Sv39（8）拼上根节点物理页号
    pub fn token(&self) -> usize {
        8usize << 60 | self.root_ppn.0
    }

    // 显式回收整棵页表的节点页帧，先子后父
    // 树深是体系结构定死的3层，所以用两层循环而不是递归
    // 调用前叶子映射必须已经全部解除，撞见还有效的叶子说明上游漏了，panic
    pub fn free_tree(mut self) {
        let mut holders: BTreeMap<usize, FrameTracker> = self
            .frames
            .drain(..)
            .map(|frame| (frame.ppn.0, frame))
            .collect();
        for pte2 in self.root_ppn.get_pte_array().iter() {
            if !pte2.is_valid() {
                continue;
            }
            assert!(!pte2.is_leaf(), "free_tree: leaf in root table");
            let l1_ppn = pte2.ppn();
            for pte1 in l1_ppn.get_pte_array().iter() {
                if !pte1.is_valid() {
                    continue;
                }
                assert!(!pte1.is_leaf(), "free_tree: leaf in mid-level table");
                let l0_ppn = pte1.ppn();
                for pte0 in l0_ppn.get_pte_array().iter() {
                    if pte0.is_valid() {
                        panic!("free_tree: found unexpected leaf page");
                    }
                }
                holders.remove(&l0_ppn.0);
            }
            holders.remove(&l1_ppn.0);
        }
        holders.remove(&self.root_ppn.0);
        assert!(holders.is_empty(), "free_tree: orphan page-table frames");
    }
}

// 跨越内核/用户边界搬运字节，一次搬一个物理页内的量：
// 解析所在页、算页内偏移、拷有界的一段、挪到下一页

// 从内核把len字节写进用户地址空间的dst_va处
pub fn copy_out(page_table: &PageTable, dst_va: usize, src: &[u8]) -> MemoryResult<()> {
    let mut copied = 0usize;
    let mut dst_va = dst_va;
    while copied < src.len() {
        let va = VirtAddr::from(dst_va);
        let pa = page_table.translate_user(va)?;
        let n = (PAGE_SIZE - va.page_offset()).min(src.len() - copied);
        let offset = pa.page_offset();
        pa.floor().get_bytes_array()[offset..offset + n]
            .copy_from_slice(&src[copied..copied + n]);
        copied += n;
        dst_va += n;
    }
    Ok(())
}

// 从用户地址空间的src_va处读满dst
pub fn copy_in(page_table: &PageTable, dst: &mut [u8], src_va: usize) -> MemoryResult<()> {
    let mut copied = 0usize;
    let mut src_va = src_va;
    while copied < dst.len() {
        let va = VirtAddr::from(src_va);
        let pa = page_table.translate_user(va)?;
        let n = (PAGE_SIZE - va.page_offset()).min(dst.len() - copied);
        let offset = pa.page_offset();
        dst[copied..copied + n]
            .copy_from_slice(&pa.floor().get_bytes_array()[offset..offset + n]);
        copied += n;
        src_va += n;
    }
    Ok(())
}

// 从用户地址空间读一个以0结尾的字符串，最多看max个字节
// max之内没等到0又没法继续读时整个调用失败
pub fn copy_in_str(page_table: &PageTable, src_va: usize, max: usize) -> MemoryResult<String> {
    let mut string = String::new();
    let mut src_va = src_va;
    let mut remain = max;
    while remain > 0 {
        let va = VirtAddr::from(src_va);
        let pa = page_table.translate_user(va)?;
        let n = (PAGE_SIZE - va.page_offset()).min(remain);
        let offset = pa.page_offset();
        for &byte in &pa.floor().get_bytes_array()[offset..offset + n] {
            if byte == 0 {
                return Ok(string);
            }
            string.push(byte as char);
        }
        remain -= n;
        src_va += n;
    }
    Err(MemoryError::UnterminatedString)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::mm::test_support;

    #[test]
    fn map_then_translate_roundtrip() {
        test_support::init_frames();
        let _serial = test_support::serial();
        let mut pt = PageTable::new().unwrap();
        let frame = frame_alloc().unwrap();
        let va = VirtAddr::from(0x40_0000usize);
        pt.map(va.floor(), frame.ppn, PTEFlags::R | PTEFlags::W | PTEFlags::U)
            .unwrap();
        // 页号查出来必须就是映射进去的那个
        let pte = pt.translate(va.floor()).unwrap();
        assert!(pte.is_valid() && pte.readable() && pte.writable());
        assert_eq!(pte.ppn(), frame.ppn);
        // 页内任意偏移都要落在同一物理页的对应偏移上
        let pa = pt.translate_user(VirtAddr::from(va.0 + 0x233)).unwrap();
        let frame_pa: PhysAddr = frame.ppn.into();
        assert_eq!(pa.0, frame_pa.0 + 0x233);
        // 从没映射过的地址查不出任何东西
        assert_eq!(
            pt.translate_user(VirtAddr::from(0x80_0000usize)),
            Err(PageError::DirPageInvalid.into())
        );
        pt.unmap(va.floor());
        pt.free_tree();
    }

    #[test]
    #[should_panic(expected = "mapped before mapping")]
    fn remap_is_fatal() {
        test_support::init_frames();
        let _serial = test_support::serial();
        let mut pt = PageTable::new().unwrap();
        let frame = frame_alloc().unwrap();
        let vpn = VirtAddr::from(0x1000usize).floor();
        pt.map(vpn, frame.ppn, PTEFlags::R | PTEFlags::U).unwrap();
        // 不先解除就再映射一次，必须当场倒下
        pt.map(vpn, frame.ppn, PTEFlags::R | PTEFlags::U).unwrap();
    }

    #[test]
    #[should_panic(expected = "is not mapped")]
    fn unmap_missing_is_fatal() {
        test_support::init_frames();
        let _serial = test_support::serial();
        let mut pt = PageTable::new().unwrap();
        let frame = frame_alloc().unwrap();
        // 先把中间节点建出来，再去解除同一节点下另一个没映射过的页
        pt.map(
            VirtAddr::from(0x1000usize).floor(),
            frame.ppn,
            PTEFlags::R | PTEFlags::U,
        )
        .unwrap();
        pt.unmap(VirtAddr::from(0x2000usize).floor());
    }

    #[test]
    #[should_panic(expected = "out of Sv39 range")]
    fn walk_beyond_maxva_is_fatal() {
        test_support::init_frames();
        let _serial = test_support::serial();
        let mut pt = PageTable::new().unwrap();
        let frame = frame_alloc().unwrap();
        let vpn = VirtPageNum(MAXVA / PAGE_SIZE);
        let _ = pt.map(vpn, frame.ppn, PTEFlags::R);
    }

    #[test]
    #[should_panic(expected = "found unexpected leaf page")]
    fn free_tree_with_live_leaf_is_fatal() {
        test_support::init_frames();
        let _serial = test_support::serial();
        let mut pt = PageTable::new().unwrap();
        let frame = frame_alloc().unwrap();
        pt.map(
            VirtAddr::from(0x3000usize).floor(),
            frame.ppn,
            PTEFlags::R | PTEFlags::U,
        )
        .unwrap();
        pt.free_tree();
    }

    #[test]
    fn copy_between_kernel_and_user() {
        test_support::init_frames();
        let _serial = test_support::serial();
        let mut pt = PageTable::new().unwrap();
        // 两个相邻的用户页，让拷贝跨一次页边界
        let frames: Vec<FrameTracker> = (0..2).map(|_| frame_alloc().unwrap()).collect();
        for (i, frame) in frames.iter().enumerate() {
            pt.map(
                VirtPageNum(i),
                frame.ppn,
                PTEFlags::R | PTEFlags::W | PTEFlags::U,
            )
            .unwrap();
        }
        let message = b"hello from the kernel side";
        let dst_va = PAGE_SIZE - 7; // 故意骑在页边界上
        copy_out(&pt, dst_va, message).unwrap();
        let mut back = [0u8; 26];
        copy_in(&pt, &mut back, dst_va).unwrap();
        assert_eq!(&back, message);

        // 字符串拷贝：有终止符就停在终止符
        copy_out(&pt, 0x10, b"ps\0garbage").unwrap();
        assert_eq!(copy_in_str(&pt, 0x10, 64).unwrap(), "ps");
        // max之内等不到终止符就失败
        assert_eq!(
            copy_in_str(&pt, dst_va, 4),
            Err(MemoryError::UnterminatedString)
        );
        // 越过映射末尾的拷贝整体失败
        assert!(copy_out(&pt, 2 * PAGE_SIZE - 4, message).is_err());

        for i in 0..2 {
            pt.unmap(VirtPageNum(i));
        }
        drop(frames);
        pt.free_tree();
    }

    #[test]
    fn kernel_pages_refused_on_user_path() {
        test_support::init_frames();
        let _serial = test_support::serial();
        let mut pt = PageTable::new().unwrap();
        let frame = frame_alloc().unwrap();
        // 没有U标志的映射走用户解析路径必须被拒绝
        pt.map(VirtPageNum(5), frame.ppn, PTEFlags::R | PTEFlags::W)
            .unwrap();
        assert_eq!(
            pt.translate_user(VirtAddr::from(5 * PAGE_SIZE)),
            Err(PageError::NotUserAccessible.into())
        );
        pt.unmap(VirtPageNum(5));
        pt.free_tree();
    }
}
