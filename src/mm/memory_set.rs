// 逻辑段与地址空间
// 一个地址空间 = 一张多级页表 + 一组逻辑段。页表下挂着所有树节点页帧，
// 每个逻辑段下挂着自己数据页的页帧，合起来就是这个空间占有的全部物理内存，
// 空间的生命周期结束时这些页帧全部回到分配器

use super::{
    frame_alloc, FrameTracker, MemoryError, MemoryResult, PTEFlags, PageTable, PageTableEntry,
    PhysPageNum, StepByOne, VPNRange, VirtAddr, VirtPageNum,
};
use crate::config::PAGE_SIZE;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

#[cfg(target_arch = "riscv64")]
use crate::config::{MEMORY_END, PLIC, PLIC_SPAN, UART0};
#[cfg(target_arch = "riscv64")]
use alloc::sync::Arc;
#[cfg(target_arch = "riscv64")]
use lazy_static::*;
#[cfg(target_arch = "riscv64")]
use spin::Mutex;

// 内核镜像的各段边界，由链接脚本给出
#[cfg(target_arch = "riscv64")]
extern "C" {
    fn stext();
    fn etext();
}

#[cfg(target_arch = "riscv64")]
lazy_static! {
    // 全系统唯一的内核地址空间
    // 由0号硬件线程在启动期单线程构建，此后只读不改，各线程只是各自激活它
    pub static ref KERNEL_SPACE: Arc<Mutex<MemorySet>> =
        Arc::new(Mutex::new(MemorySet::new_kernel()));
}

// 地址空间
pub struct MemorySet {
    page_table: PageTable,
    areas: Vec<MapArea>,
}

impl MemorySet {
    // 新建一个空的地址空间，只有根节点
    pub fn new_bare() -> MemoryResult<Self> {
        Ok(Self {
            page_table: PageTable::new()?,
            areas: Vec::new(),
        })
    }

    pub fn token(&self) -> usize {
        self.page_table.token()
    }

    pub fn translate(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.page_table.translate(vpn)
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    // 插入一个以页帧方式映射的逻辑段
    pub fn insert_framed_area(
        &mut self,
        start_va: VirtAddr,
        end_va: VirtAddr,
        permission: MapPermission,
    ) -> MemoryResult<()> {
        self.push(
            MapArea::new(start_va, end_va, MapType::Framed, permission),
            None,
        )
    }

    // 插入一个恒等映射的逻辑段，虚拟地址等于物理地址
    // 内核靠它保证指针在开启分页前后数值不变
    pub fn insert_identical_area(
        &mut self,
        start_va: VirtAddr,
        end_va: VirtAddr,
        permission: MapPermission,
    ) -> MemoryResult<()> {
        self.push(
            MapArea::new(start_va, end_va, MapType::Identical, permission),
            None,
        )
    }

    // 把逻辑段加入地址空间，需要的话写入初始数据
    fn push(&mut self, mut map_area: MapArea, data: Option<&[u8]>) -> MemoryResult<()> {
        map_area.map(&mut self.page_table)?;
        if let Some(data) = data {
            map_area.copy_data(&self.page_table, data);
        }
        self.areas.push(map_area);
        Ok(())
    }

    // 构建内核地址空间：设备窗口、代码段、数据和剩余物理内存，全部恒等映射
    // 只在启动期由0号硬件线程调用一次，这里失败就没有然后了，直接panic
    #[cfg(target_arch = "riscv64")]
    pub fn new_kernel() -> Self {
        let mut memory_set = Self::new_bare().expect("new_kernel: no frame for root table");
        info!("mapping uart registers");
        memory_set
            .insert_identical_area(
                UART0.into(),
                (UART0 + PAGE_SIZE).into(),
                MapPermission::R | MapPermission::W,
            )
            .expect("new_kernel: map uart failed");
        info!("mapping plic window");
        memory_set
            .insert_identical_area(
                PLIC.into(),
                (PLIC + PLIC_SPAN).into(),
                MapPermission::R | MapPermission::W,
            )
            .expect("new_kernel: map plic failed");
        info!(".text [{:#x}, {:#x})", stext as usize, etext as usize);
        memory_set
            .insert_identical_area(
                (stext as usize).into(),
                (etext as usize).into(),
                MapPermission::R | MapPermission::X,
            )
            .expect("new_kernel: map text failed");
        info!("mapping data and physical memory");
        memory_set
            .insert_identical_area(
                (etext as usize).into(),
                MEMORY_END.into(),
                MapPermission::R | MapPermission::W,
            )
            .expect("new_kernel: map ram failed");
        memory_set
    }

    // 激活本地址空间：先fence让硬件能看到此前对页表内存的所有写入，
    // 写satp切换根页表并启用Sv39，再fence冲掉激活前攒下的过期TLB项
    // 每个硬件线程在碰任何依赖新映射的虚拟地址之前恰好调用一次
    #[cfg(target_arch = "riscv64")]
    pub fn activate(&self) {
        let satp = self.page_table.token();
        unsafe {
            riscv::asm::sfence_vma_all();
            riscv::register::satp::write(satp);
            riscv::asm::sfence_vma_all();
        }
    }

    // 装入第一个用户镜像：程序段从虚拟地址0开始，按页上取整，
    // 权限RWXU；紧挨着往上再给同样多的页当初始栈，RWU不可执行
    // 返回占用的总虚拟大小。启动关键路径，失败直接panic
    pub fn from_initial_image(data: &[u8]) -> (Self, usize) {
        let mut memory_set = Self::new_bare().expect("from_initial_image: no frame for root");
        let prog_pages = VirtAddr::from(data.len()).ceil().0.max(1);
        let prog_end = prog_pages * PAGE_SIZE;
        let total = prog_end * 2;
        memory_set
            .push(
                MapArea::new(
                    0.into(),
                    prog_end.into(),
                    MapType::Framed,
                    MapPermission::R | MapPermission::W | MapPermission::X | MapPermission::U,
                ),
                if data.is_empty() { None } else { Some(data) },
            )
            .expect("from_initial_image: program pages failed");
        memory_set
            .push(
                MapArea::new(
                    prog_end.into(),
                    total.into(),
                    MapType::Framed,
                    MapPermission::R | MapPermission::W | MapPermission::U,
                ),
                None,
            )
            .expect("from_initial_image: stack pages failed");
        (memory_set, total)
    }

    // 把空间从old_size长到new_size，新页清零、R|U再加上调用者要的权限位
    // 任何一步失败就把这次长出来的页全部退回去，报0，绝不留下长了一半的空间
    pub fn grow(&mut self, old_size: usize, new_size: usize, extra_perm: MapPermission) -> usize {
        if new_size <= old_size {
            return old_size;
        }
        let start_vpn = VirtAddr::from(old_size).ceil();
        let end_vpn = VirtAddr::from(new_size).ceil();
        if start_vpn < end_vpn {
            let mut area = MapArea::from_range(
                VPNRange::new(start_vpn, end_vpn),
                MapType::Framed,
                MapPermission::R | MapPermission::U | extra_perm,
            );
            if area.map(&mut self.page_table).is_err() {
                return 0;
            }
            self.areas.push(area);
        }
        new_size
    }

    // 把空间从old_size缩回new_size，只有跨过整页边界才真的解除映射并退页
    // new_size不小于old_size时是无动作，不算错误
    pub fn shrink(&mut self, old_size: usize, new_size: usize) -> usize {
        if new_size >= old_size {
            return old_size;
        }
        let target_vpn = VirtAddr::from(new_size).ceil();
        let old_end = VirtAddr::from(old_size).ceil();
        if target_vpn < old_end {
            let page_table = &mut self.page_table;
            self.areas.retain_mut(|area| {
                if area.vpn_range.get_start() >= target_vpn {
                    area.unmap(page_table);
                    false
                } else if area.vpn_range.get_end() > target_vpn {
                    area.narrow(page_table, target_vpn);
                    true
                } else {
                    true
                }
            });
        }
        new_size
    }

    // 复制一份地址空间：size以下每个已映射页都配新页帧、逐字节拷贝、
    // 权限与源页表项完全一致。半路失败时把建了一半的副本整个丢弃，
    // 其页帧随RAII回到分配器，源空间不受任何影响
    pub fn from_existed_user(src: &MemorySet, size: usize) -> MemoryResult<Self> {
        let mut memory_set = Self::new_bare()?;
        let limit = VirtAddr::from(size).ceil();
        for area in src.areas.iter() {
            let start = area.vpn_range.get_start();
            let end = area.vpn_range.get_end().min(limit);
            if start >= end {
                continue;
            }
            let mut new_area =
                MapArea::from_range(VPNRange::new(start, end), MapType::Framed, area.map_perm);
            for vpn in VPNRange::new(start, end) {
                let src_pte = match src.page_table.translate(vpn) {
                    Some(pte) if pte.is_valid() => pte,
                    _ => continue,
                };
                let frame = frame_alloc().ok_or(MemoryError::MemoryNotEnough)?;
                // 按源页表项的原样标志映射，map会自己补V
                memory_set.page_table.map(vpn, frame.ppn, src_pte.flags())?;
                frame
                    .ppn
                    .get_bytes_array()
                    .copy_from_slice(src_pte.ppn().get_bytes_array());
                new_area.data_frames.insert(vpn, frame);
            }
            memory_set.areas.push(new_area);
        }
        Ok(memory_set)
    }

    // 拆除地址空间：先解除size以下所有叶子映射并退掉数据页，
    // 再显式回收整棵页表。此时树上若还挂着有效叶子，free_tree会当场panic
    pub fn destroy(self, size: usize) {
        let MemorySet {
            mut page_table,
            mut areas,
        } = self;
        let limit = VirtAddr::from(size).ceil();
        for area in areas.iter_mut() {
            let range = area.vpn_range;
            for vpn in range {
                if vpn < limit {
                    area.unmap_one(&mut page_table, vpn);
                }
            }
        }
        // 数据页帧先归还，然后才轮到树节点
        drop(areas);
        page_table.free_tree();
    }

    // 摘掉一页的U标志，用户就再也摸不到它，做栈保护页
    pub fn clear_user_access(&mut self, va: VirtAddr) {
        self.page_table.clear_user(va.floor());
    }
}

// 逻辑段：一段连续虚拟页，以同一种方式映射、带同一组权限
pub struct MapArea {
    vpn_range: VPNRange,
    data_frames: BTreeMap<VirtPageNum, FrameTracker>,
    map_type: MapType,
    map_perm: MapPermission,
}

impl MapArea {
    // 起止地址分别下取整、上取整到页号。空段没有意义，禁止
    pub fn new(
        start_va: VirtAddr,
        end_va: VirtAddr,
        map_type: MapType,
        map_perm: MapPermission,
    ) -> Self {
        assert!(end_va > start_va, "mapping an empty area");
        let start_vpn: VirtPageNum = start_va.floor();
        let end_vpn: VirtPageNum = end_va.ceil();
        Self {
            vpn_range: VPNRange::new(start_vpn, end_vpn),
            data_frames: BTreeMap::new(),
            map_type,
            map_perm,
        }
    }

    fn from_range(vpn_range: VPNRange, map_type: MapType, map_perm: MapPermission) -> Self {
        Self {
            vpn_range,
            data_frames: BTreeMap::new(),
            map_type,
            map_perm,
        }
    }

    // 映射单页。Framed方式先领页帧再挂表，挂表失败时页帧原地退回
    fn map_one(&mut self, page_table: &mut PageTable, vpn: VirtPageNum) -> MemoryResult<()> {
        let pte_flags = PTEFlags::from_bits(self.map_perm.bits()).unwrap();
        match self.map_type {
            MapType::Identical => {
                page_table.map(vpn, PhysPageNum(vpn.0), pte_flags)?;
            }
            MapType::Framed => {
                let frame = frame_alloc().ok_or(MemoryError::MemoryNotEnough)?;
                page_table.map(vpn, frame.ppn, pte_flags)?;
                self.data_frames.insert(vpn, frame);
            }
        }
        Ok(())
    }

    fn unmap_one(&mut self, page_table: &mut PageTable, vpn: VirtPageNum) {
        if self.map_type == MapType::Framed {
            self.data_frames.remove(&vpn);
        }
        page_table.unmap(vpn);
    }

    // 整段映射。半路失败就把本段已经映射的部分原路退回，再把错误交上去
    pub fn map(&mut self, page_table: &mut PageTable) -> MemoryResult<()> {
        for vpn in self.vpn_range {
            if let Err(e) = self.map_one(page_table, vpn) {
                for mapped in VPNRange::new(self.vpn_range.get_start(), vpn) {
                    self.unmap_one(page_table, mapped);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn unmap(&mut self, page_table: &mut PageTable) {
        for vpn in self.vpn_range {
            self.unmap_one(page_table, vpn);
        }
    }

    // 把段尾缩到new_end，退掉被砍掉的页
    fn narrow(&mut self, page_table: &mut PageTable, new_end: VirtPageNum) {
        for vpn in VPNRange::new(new_end, self.vpn_range.get_end()) {
            self.unmap_one(page_table, vpn);
        }
        self.vpn_range = VPNRange::new(self.vpn_range.get_start(), new_end);
    }

    // 把数据写进本段映射到的页帧里，只对Framed段有意义
    pub fn copy_data(&mut self, page_table: &PageTable, data: &[u8]) {
        assert_eq!(self.map_type, MapType::Framed);
        let mut start: usize = 0;
        let mut current_vpn = self.vpn_range.get_start();
        let len = data.len();
        loop {
            let src = &data[start..len.min(start + PAGE_SIZE)];
            let dst = &mut page_table
                .translate(current_vpn)
                .unwrap()
                .ppn()
                .get_bytes_array()[..src.len()];
            dst.copy_from_slice(src);
            start += PAGE_SIZE;
            if start >= len {
                break;
            }
            current_vpn.step();
        }
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
// 映射方式：恒等（内核用）或页帧（用户用）
pub enum MapType {
    Identical,
    Framed,
}

bitflags! {
    // 逻辑段的访问权限，是PTEFlags的子集
    pub struct MapPermission: u8 {
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
    }
}
