//! Terminal stage: squash the rootfs, assemble the hybrid BIOS+EFI ISO,
//! write checksum sidecars.

use crate::cfg::dracut::DracutCompression;
use crate::errors::{BuildError, Result};
use crate::pipeline::{BuildContext, BuildModule};
use crate::run;
use crate::tpl;
use crate::util::{self, run_streamed};
use bytesize::ByteSize;
use sha2::Digest;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// BIOS boot stubs as shipped by Debian's isolinux/syslinux packages.
const ISOLINUX_BIN: &str = "/usr/lib/ISOLINUX/isolinux.bin";
const ISOHDPFX_BIN: &str = "/usr/lib/ISOLINUX/isohdpfx.bin";
const SYSLINUX_MODULES: &str = "/usr/lib/syslinux/modules/bios";
const C32_MODULES: &[&str] = &["ldlinux.c32", "libcom32.c32", "libutil.c32", "menu.c32"];

pub struct IsoGeneration;

impl BuildModule for IsoGeneration {
	fn name(&self) -> &'static str {
		"iso_generation"
	}

	fn execute(
		&self, ctx: &BuildContext, _resume: Option<serde_json::Value>,
	) -> Result<Option<serde_json::Value>> {
		let iso_tree = ctx.workspace.iso_dir();
		let chroot = ctx.workspace.chroot();
		let idle = ctx.plan.builder_config.watchdog_idle();

		copy_kernel_and_initramfs(&chroot, &iso_tree)?;
		squash_rootfs(ctx, &chroot, &iso_tree.join("live/filesystem.squashfs"))?;
		util::copy_dir(&ctx.workspace.efi_dir().join("EFI"), &iso_tree.join("EFI"))?;
		make_efiboot_image(ctx, &iso_tree)?;
		stage_isolinux(ctx, &iso_tree)?;
		verify_layout(&iso_tree)?;

		let volid = ctx.plan.builder_config.volume_id();
		let image = ctx.workspace.output_dir().join(format!(
			"{}-{}-amd64.iso",
			ctx.plan.builder_config.build_name, ctx.plan.builder_config.version_tag
		));
		info!(?image, %volid, "Assembling hybrid ISO");
		let mut cmd = Command::new("xorrisofs");
		for arg in xorriso_args(&volid, &iso_tree, &image) {
			cmd.arg(arg);
		}
		run_streamed(&mut cmd, idle).map_err(|e| BuildError::IsoAssembly(e.to_string()))?;

		write_checksum_sidecars(&image)?;
		info!(?image, "ISO ready");
		Ok(Some(serde_json::json!({ "iso": image })))
	}
}

/// Teacher-tested layout: kernel from the chroot's /boot, initramfs under
/// its canonical name.
fn copy_kernel_and_initramfs(chroot: &Path, iso_tree: &Path) -> Result<()> {
	let boot = iso_tree.join("boot");
	std::fs::create_dir_all(&boot)?;

	let vmlinuz = newest_matching(&chroot.join("boot"), "vmlinuz-")?
		.ok_or_else(|| BuildError::missing("a vmlinuz in the chroot /boot"))?;
	std::fs::copy(&vmlinuz, boot.join("vmlinuz"))?;

	let initramfs = newest_matching(&chroot.join("boot"), "initramfs-")?
		.ok_or_else(|| BuildError::missing("an initramfs in the chroot /boot (run dracut_config)"))?;
	std::fs::copy(&initramfs, boot.join("initramfs.img"))?;
	debug!(?vmlinuz, ?initramfs, "Boot files copied into ISO tree");
	Ok(())
}

fn newest_matching(dir: &Path, prefix: &str) -> Result<Option<PathBuf>> {
	let mut candidates: Vec<PathBuf> = std::fs::read_dir(dir)?
		.filter_map(std::result::Result::ok)
		.filter(|e| {
			e.file_name().to_string_lossy().starts_with(prefix)
				&& !e.file_name().to_string_lossy().contains("-rescue-")
		})
		.map(|e| e.path())
		.collect();
	candidates.sort();
	Ok(candidates.pop())
}

fn squash_rootfs(ctx: &BuildContext, chroot: &Path, image: &Path) -> Result<()> {
	if let Some(parent) = image.parent() {
		std::fs::create_dir_all(parent)?;
	}
	info!("Squashing live rootfs");
	let comp_args = squashfs_compression_args(ctx.plan.builder_config.squashfs_compression);
	let mut cmd = Command::new("mksquashfs");
	cmd.arg(chroot).arg(image);
	for arg in comp_args {
		cmd.arg(arg);
	}
	cmd.args(["-b", "1048576", "-noappend"])
		.args(["-e", "dev/", "-e", "proc/", "-e", "sys/", "-e", "run/", "-e", "tmp/"])
		.args(["-p", "dev 755 0 0", "-p", "proc 755 0 0", "-p", "sys 755 0 0"])
		.args(["-p", "run 755 0 0", "-p", "tmp 1777 0 0"]);
	run_streamed(&mut cmd, ctx.plan.builder_config.watchdog_idle())
		.map_err(|e| BuildError::IsoAssembly(e.to_string()))?;
	Ok(())
}

fn squashfs_compression_args(comp: DracutCompression) -> Vec<&'static str> {
	match comp {
		DracutCompression::Zstd => vec!["-comp", "zstd", "-Xcompression-level", "19"],
		DracutCompression::Gzip => vec!["-comp", "gzip", "-Xcompression-level", "9"],
		DracutCompression::Lz4 => vec!["-comp", "lz4", "-Xhc"],
		DracutCompression::Xz => vec!["-comp", "xz", "-Xbcj", "x86"],
	}
}

/// El Torito EFI image: a small FAT filesystem holding the staged EFI tree.
fn make_efiboot_image(ctx: &BuildContext, iso_tree: &Path) -> Result<()> {
	let efi_src = ctx.workspace.efi_dir();
	let image = iso_tree.join("boot/efiboot.img");

	let payload = dir_size(&efi_src)?;
	// FAT overhead plus headroom, floor of 16 MiB
	let size = (payload + payload / 4).max(16 * 1024 * 1024).next_multiple_of(1024 * 1024);
	util::create_sparse(&image, size)?;
	let image_str = image.to_string_lossy().into_owned();
	run!("mkfs.vfat", "-n", "EFIBOOT", image_str.as_str())
		.map_err(|e| BuildError::IsoAssembly(e.to_string()))?;

	let (ldp, handle) = util::loopdev_with_file(&image)?;
	let mnt = tempfile::tempdir()?;
	let mnt_path = mnt.path().to_string_lossy().into_owned();
	let ldp_str = ldp.to_string_lossy().into_owned();
	let mount_res: Result<()> = (|| {
		run!("mount", &ldp_str, &mnt_path).map_err(|e| BuildError::IsoAssembly(e.to_string()))?;
		let copy = util::copy_dir(&efi_src.join("EFI"), &mnt.path().join("EFI"));
		run!("umount", &mnt_path).map_err(|e| BuildError::IsoAssembly(e.to_string()))?;
		copy
	})();
	drop(handle);
	mount_res?;
	debug!(?image, size = %ByteSize::b(size), "EFI boot image built");
	Ok(())
}

fn dir_size(dir: &Path) -> Result<u64> {
	let mut total = 0;
	for entry in std::fs::read_dir(dir)? {
		let entry = entry?;
		let meta = entry.metadata()?;
		total += if meta.is_dir() { dir_size(&entry.path())? } else { meta.len() };
	}
	Ok(total)
}

fn stage_isolinux(ctx: &BuildContext, iso_tree: &Path) -> Result<()> {
	let dest = iso_tree.join("isolinux");
	std::fs::create_dir_all(&dest)?;
	if !Path::new(ISOLINUX_BIN).exists() {
		return Err(BuildError::missing(format!("{ISOLINUX_BIN} (install: isolinux)")));
	}
	std::fs::copy(ISOLINUX_BIN, dest.join("isolinux.bin"))?;
	for module in C32_MODULES {
		let src = Path::new(SYSLINUX_MODULES).join(module);
		if !src.exists() {
			return Err(BuildError::missing(format!("{} (install: syslinux-common)", src.display())));
		}
		std::fs::copy(&src, dest.join(module))?;
	}

	let volid = ctx.plan.builder_config.volume_id();
	let distro = ctx.plan.builder_config.build_name.clone();
	let serial = ctx.plan.bootloader_config.serial_console.clone().unwrap_or_default();
	tpl!("isolinux.cfg.tera" => { volid, distro, serial } => dest.join("isolinux.cfg"));
	Ok(())
}

/// The layout the produced medium promises: squashfs, kernel, initramfs
/// and the EFI entry point.
fn verify_layout(iso_tree: &Path) -> Result<()> {
	for required in [
		"boot/vmlinuz",
		"boot/initramfs.img",
		"boot/efiboot.img",
		"live/filesystem.squashfs",
		"EFI/BOOT/BOOTX64.EFI",
		"isolinux/isolinux.bin",
	] {
		if !iso_tree.join(required).exists() {
			return Err(BuildError::IsoAssembly(format!("ISO tree is missing {required}")));
		}
	}
	Ok(())
}

fn xorriso_args(volid: &str, iso_tree: &Path, image: &Path) -> Vec<String> {
	let mut args: Vec<String> = ["-o", &image.to_string_lossy(), "-V", volid]
		.iter()
		.map(|s| (*s).to_owned())
		.collect();
	args.extend(
		[
			"-J",
			"-rational-rock",
			"-isohybrid-mbr",
			ISOHDPFX_BIN,
			"-c",
			"isolinux/boot.cat",
			"-b",
			"isolinux/isolinux.bin",
			"-no-emul-boot",
			"-boot-load-size",
			"4",
			"-boot-info-table",
			"-eltorito-alt-boot",
			"-e",
			"boot/efiboot.img",
			"-no-emul-boot",
			"-isohybrid-gpt-basdat",
		]
		.iter()
		.map(|s| (*s).to_owned()),
	);
	args.push(iso_tree.to_string_lossy().into_owned());
	args
}

/// `<iso>.sha256` and `<iso>.md5`, streamed.
fn write_checksum_sidecars(image: &Path) -> Result<()> {
	let name = image
		.file_name()
		.ok_or_else(|| BuildError::other("iso path has no file name"))?
		.to_string_lossy();

	let mut sha = sha2::Sha256::new();
	let mut md = md5::Md5::new();
	let mut file = std::fs::File::open(image)?;
	let mut buf = vec![0_u8; 1024 * 1024];
	loop {
		let n = file.read(&mut buf)?;
		if n == 0 {
			break;
		}
		let chunk = buf.get(..n).unwrap_or_default();
		sha.update(chunk);
		md.update(chunk);
	}
	let sha_hex = hex(&sha.finalize());
	let md5_hex = hex(&md.finalize());

	util::just_write(
		image.with_extension("iso.sha256"),
		format!("{sha_hex}  {name}\n"),
	)?;
	util::just_write(image.with_extension("iso.md5"), format!("{md5_hex}  {name}\n"))?;
	debug!(%sha_hex, "Checksum sidecars written");
	Ok(())
}

fn hex(bytes: &[u8]) -> String {
	bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
		use std::fmt::Write;
		drop(write!(s, "{b:02x}"));
		s
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn compression_args_match_mksquashfs_surface() {
		assert_eq!(
			squashfs_compression_args(DracutCompression::Zstd),
			["-comp", "zstd", "-Xcompression-level", "19"]
		);
		assert_eq!(squashfs_compression_args(DracutCompression::Lz4), ["-comp", "lz4", "-Xhc"]);
	}

	#[test]
	fn xorriso_args_describe_hybrid_boot() {
		let args = xorriso_args("ZFORGE-DEV", Path::new("/w/iso"), Path::new("/w/out/z.iso"));
		let joined = args.join(" ");
		assert!(joined.contains("-b isolinux/isolinux.bin"));
		assert!(joined.contains("-e boot/efiboot.img"));
		assert!(joined.contains("-isohybrid-gpt-basdat"));
		assert!(joined.contains("-V ZFORGE-DEV"));
	}

	#[test]
	fn layout_check_names_the_missing_piece() {
		let tmp = tempfile::tempdir().unwrap();
		let err = verify_layout(tmp.path()).unwrap_err();
		assert!(err.to_string().contains("boot/vmlinuz"));
	}

	#[test]
	fn sidecars_carry_hex_digest_and_name() {
		let tmp = tempfile::tempdir().unwrap();
		let iso = tmp.path().join("test.iso");
		std::fs::write(&iso, b"not really an iso").unwrap();
		write_checksum_sidecars(&iso).unwrap();
		let sha = std::fs::read_to_string(tmp.path().join("test.iso.sha256")).unwrap();
		let md5 = std::fs::read_to_string(tmp.path().join("test.iso.md5")).unwrap();
		assert!(sha.ends_with("  test.iso\n"));
		assert_eq!(sha.split_whitespace().next().unwrap().len(), 64);
		assert_eq!(md5.split_whitespace().next().unwrap().len(), 32);
	}

	#[test]
	fn hex_encodes_lowercase() {
		assert_eq!(hex(&[0xde, 0xad, 0x00]), "dead00");
	}
}
